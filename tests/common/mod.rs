//! Shared end-to-end test harness: an in-process HTTP server that serves
//! pre-built tarballs, plus tarball/digest builders mirroring what a real
//! registry would hand the Fetcher.

use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Builds a gzip-compressed tar archive with the conventional leading
/// `package/` directory every entry is nested under (stripped by the
/// Extractor), optionally marking a file executable.
pub fn build_tarball(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents, executable) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(if *executable { 0o755 } else { 0o644 });
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{name}"), *contents)
            .expect("append tar entry");
    }
    let tar_bytes = builder.into_inner().expect("finish tar");

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).expect("gzip tar");
    encoder.finish().expect("finish gzip")
}

/// Same base64 alphabet the Fetcher's integrity check uses.
pub fn base64_encode(bytes: &[u8]) -> String {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(TABLE[(b0 >> 2) as usize] as char);
        out.push(TABLE[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            TABLE[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            TABLE[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

pub fn sha512_integrity(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    format!("sha512:{}", base64_encode(&hasher.finalize()))
}

/// A tiny single-purpose HTTP/1.1 server: every registered path is served
/// verbatim as a 200 response body, anything else gets a 404. Good enough
/// to exercise the real `reqwest`-based Fetcher without a registry.
pub struct TestServer {
    pub base_url: String,
}

impl TestServer {
    pub async fn start(files: HashMap<String, Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let files = Arc::new(files);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let files = files.clone();
                tokio::spawn(async move {
                    let _ = handle_conn(stream, files).await;
                });
            }
        });

        TestServer {
            base_url: format!("http://{addr}"),
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    files: Arc<HashMap<String, Vec<u8>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16_384 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    if let Some(body) = files.get(&path) {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(header.as_bytes()).await?;
        stream.write_all(body).await?;
    } else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Writes a lockfile document to `path` from a simple `(install_path,
/// name, version, resolved_url, integrity, bin, link_source)` shape.
pub fn write_lockfile(path: &std::path::Path, paths_json: &str) {
    let doc = format!(r#"{{"paths": {paths_json}}}"#);
    std::fs::write(path, doc).expect("write lockfile");
}
