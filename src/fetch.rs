//! Default HTTP fetch behavior.
//!
//! Issues a GET through a shared reqwest client with redirects disabled (the
//! engine owns redirect handling), streams the body with the capture bounded
//! by the trace's fetch limit, decodes gzip/deflate bodies, and feeds the
//! decoded chunks to the trace's content processors.

use crate::trace::{FetchResult, FetchTimings, Trace};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use std::io::{self, Read};
use std::sync::OnceLock;
use tokio::time::Instant;
use tracing::{debug, trace};

const DECODE_CHUNK: usize = 64 * 1024;

fn shared_client() -> Result<&'static reqwest::Client> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if CLIENT.get().is_none() {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let _ = CLIENT.set(client);
    }
    CLIENT
        .get()
        .ok_or_else(|| anyhow!("http client initialization raced"))
}

/// The default `fetch_page_content` implementation.
pub async fn default_fetch(trace: &Trace) -> Result<FetchResult> {
    let client = shared_client()?;
    let mut request = client.get(trace.url.clone());
    for (name, value) in &trace.request {
        request = request.header(name.as_str(), value.as_str());
    }

    trace!("fetching {}", trace.url);
    let sent_at = Instant::now();
    let response = request.send().await?;
    // reqwest does not expose connect/send separately; both fold into wait.
    let wait = sent_at.elapsed().as_millis() as u64;

    let mut result = FetchResult {
        version: format!("{:?}", response.version()),
        status: response.status().as_u16(),
        status_text: response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        ..FetchResult::default()
    };
    for (name, value) in response.headers() {
        result.add_header(
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    let encoding = result
        .header("content-encoding")
        .map(str::to_ascii_lowercase);

    let receive_started = Instant::now();
    let mut wire: Vec<u8> = Vec::new();
    let mut received: u64 = 0;
    let mut response = response;
    while let Some(chunk) = response.chunk().await? {
        let remaining = trace.fetch_limit.saturating_sub(received) as usize;
        if remaining == 0 {
            debug!("fetch limit reached for {}", trace.url);
            break;
        }
        let take = chunk.len().min(remaining);
        received += take as u64;
        wire.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            debug!("fetch limit reached for {}", trace.url);
            break;
        }
    }
    result.received_size = received;
    result.timings = FetchTimings {
        connect: 0,
        send: 0,
        wait,
        receive: receive_started.elapsed().as_millis() as u64,
    };

    let decoded = decode_body(encoding.as_deref(), &wire, trace.fetch_limit);
    result.logical_size = decoded.iter().map(|chunk| chunk.len() as u64).sum();

    if let Some(factory) = &trace.processors {
        let mut processors = factory();
        for chunk in &decoded {
            for processor in processors.iter_mut() {
                processor.update(chunk);
            }
        }
        for mut processor in processors {
            let value = processor.finish();
            result.processed.insert(processor.name().to_string(), value);
        }
    }

    result.content = decoded;
    trace!(
        status = result.status,
        received = result.received_size,
        logical = result.logical_size,
        "fetched {}",
        trace.url
    );
    Ok(result)
}

/// Decodes the captured body per its content-encoding. A truncated or
/// corrupt encoded stream falls back to the raw bytes.
fn decode_body(encoding: Option<&str>, wire: &[u8], limit: u64) -> Vec<Bytes> {
    match encoding {
        Some("gzip") | Some("x-gzip") => {
            decode_stream(MultiGzDecoder::new(wire), limit).unwrap_or_else(|_| raw_chunk(wire))
        }
        Some("deflate") => {
            decode_stream(ZlibDecoder::new(wire), limit).unwrap_or_else(|_| raw_chunk(wire))
        }
        _ => raw_chunk(wire),
    }
}

fn decode_stream<R: Read>(mut reader: R, limit: u64) -> io::Result<Vec<Bytes>> {
    let mut chunks = Vec::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; DECODE_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let take = n.min(limit.saturating_sub(total) as usize);
                if take == 0 {
                    break;
                }
                total += take as u64;
                chunks.push(Bytes::copy_from_slice(&buf[..take]));
                if take < n {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if chunks.is_empty() {
                    return Err(err);
                }
                // Truncated stream; keep what decoded.
                break;
            }
        }
    }
    Ok(chunks)
}

fn raw_chunk(wire: &[u8]) -> Vec<Bytes> {
    if wire.is_empty() {
        Vec::new()
    } else {
        vec![Bytes::copy_from_slice(wire)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn identity_bodies_pass_through() {
        let chunks = decode_body(None, b"hello world", 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"hello world");
    }

    #[test]
    fn gzip_bodies_are_decoded() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let encoded = gzip(&body);
        let chunks = decode_body(Some("gzip"), &encoded, u64::MAX);
        let decoded: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(decoded, body);
    }

    #[test]
    fn decoded_output_is_capped_at_the_limit() {
        let body = vec![b'x'; 256 * 1024];
        let encoded = gzip(&body);
        let chunks = decode_body(Some("gzip"), &encoded, 100 * 1024);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 100 * 1024);
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw_bytes() {
        let chunks = decode_body(Some("gzip"), b"definitely not gzip", 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"definitely not gzip");
    }

    #[test]
    fn empty_bodies_yield_no_chunks() {
        assert!(decode_body(None, b"", 1024).is_empty());
    }
}
