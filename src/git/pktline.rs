//! The small subset of pkt-line framing the gateway writes itself: the
//! Smart-HTTP service announcement that precedes a ref advertisement.
//!
//! Everything else on the wire comes verbatim from the Git service binary.

use bytes::{BufMut, Bytes, BytesMut};

use super::service::Service;

/// Flush packet.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Append `payload` as one pkt-line: four lowercase hex digits holding the
/// total length (prefix included), then the payload.
fn put_pkt_line(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    buf.put_slice(payload);
}

/// `<len># service=<svc>\n0000`, written before the output of
/// `--advertise-refs` on the `info/refs` endpoint.
pub fn service_announcement(service: Service) -> Bytes {
    let line = format!("# service={service}\n");
    let mut buf = BytesMut::with_capacity(line.len() + 8);
    put_pkt_line(&mut buf, line.as_bytes());
    buf.put_slice(FLUSH_PKT);
    buf.freeze()
}
