//! The exact byte grammar the trace profiler's send buffer uses, shared so
//! agent-side producers and test-side consumers agree on one definition.
//!
//! Fields are separated by a literal NUL, records by a literal `\x01`. There
//! is no escaping: frame names and filenames are assumed not to contain
//! either byte, which holds for every runtime identifier and path.

pub const FIELD_SEP: u8 = b'\0';
pub const RECORD_SEP: u8 = 0x01;

pub const NATIVE_ORIGIN: &str = "<built-in>";
pub const AWAIT_FRAME_NAME: &str = "[await]";

/// One entry, ready to be appended to the send buffer, already in its final
/// on-wire byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload(Vec<u8>);

impl FramePayload {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `<name>\0<origin>\0<linenum>\x01<start-ns>\x01<cost-ns>\x01<parent-offset>`
    pub fn normal(
        name: &str,
        origin: &str,
        linenum: u32,
        start_ns: u64,
        cost_ns: u64,
        parent_offset: i64,
    ) -> Self {
        let header = header_triple(name, origin, linenum);
        FramePayload(finish(header, start_ns, cost_ns, parent_offset))
    }

    /// `[await]\0\0\x010\x01<start-ns>\x01<cost-ns>\x01<parent-offset>`
    pub fn await_switch(start_ns: u64, cost_ns: u64, parent_offset: i64) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(AWAIT_FRAME_NAME.as_bytes());
        buf.push(FIELD_SEP);
        buf.push(FIELD_SEP);
        buf.push(RECORD_SEP);
        buf.push(b'0');
        buf.push(RECORD_SEP);
        buf.extend_from_slice(start_ns.to_string().as_bytes());
        buf.push(RECORD_SEP);
        buf.extend_from_slice(cost_ns.to_string().as_bytes());
        buf.push(RECORD_SEP);
        buf.extend_from_slice(parent_offset.to_string().as_bytes());
        FramePayload(buf)
    }

    /// A finished async frame: the header was captured at first entry and is
    /// replayed verbatim here.
    pub fn finished_async(
        header: &FrameHeader,
        start_ns: u64,
        cost_ns: u64,
        parent_offset: i64,
    ) -> Self {
        FramePayload(finish(header.0.clone(), start_ns, cost_ns, parent_offset))
    }
}

/// The `<name>\0<origin>\0<linenum>` triple captured once, at a frame's
/// first activation, and reused for every later emission of that frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader(Vec<u8>);

impl FrameHeader {
    pub fn new(name: &str, origin: &str, linenum: u32) -> Self {
        FrameHeader(header_triple(name, origin, linenum))
    }
}

fn header_triple(name: &str, origin: &str, linenum: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + origin.len() + 16);
    buf.extend_from_slice(name.as_bytes());
    buf.push(FIELD_SEP);
    buf.extend_from_slice(origin.as_bytes());
    buf.push(FIELD_SEP);
    buf.extend_from_slice(linenum.to_string().as_bytes());
    buf
}

fn finish(mut header: Vec<u8>, start_ns: u64, cost_ns: u64, parent_offset: i64) -> Vec<u8> {
    header.push(RECORD_SEP);
    header.extend_from_slice(start_ns.to_string().as_bytes());
    header.push(RECORD_SEP);
    header.extend_from_slice(cost_ns.to_string().as_bytes());
    header.push(RECORD_SEP);
    header.extend_from_slice(parent_offset.to_string().as_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn normal_frame_matches_grammar() {
        let p = FramePayload::normal("handle_request", "server.py", 42, 1000, 500, -1);
        let expected = join(&[
            b"handle_request",
            &[FIELD_SEP],
            b"server.py",
            &[FIELD_SEP],
            b"42",
            &[RECORD_SEP],
            b"1000",
            &[RECORD_SEP],
            b"500",
            &[RECORD_SEP],
            b"-1",
        ]);
        assert_eq!(p.as_bytes(), expected.as_slice());
    }

    #[test]
    fn await_frame_matches_grammar() {
        let p = FramePayload::await_switch(10, 3, 2);
        let expected = join(&[
            AWAIT_FRAME_NAME.as_bytes(),
            &[FIELD_SEP],
            &[FIELD_SEP],
            &[RECORD_SEP],
            b"0",
            &[RECORD_SEP],
            b"10",
            &[RECORD_SEP],
            b"3",
            &[RECORD_SEP],
            b"2",
        ]);
        assert_eq!(p.as_bytes(), expected.as_slice());
    }

    #[test]
    fn finished_async_replays_captured_header() {
        let header = FrameHeader::new("fetch", "app.py", 7);
        let p = FramePayload::finished_async(&header, 100, 40, 0);
        let expected = join(&[
            b"fetch",
            &[FIELD_SEP],
            b"app.py",
            &[FIELD_SEP],
            b"7",
            &[RECORD_SEP],
            b"100",
            &[RECORD_SEP],
            b"40",
            &[RECORD_SEP],
            b"0",
        ]);
        assert_eq!(p.as_bytes(), expected.as_slice());
    }
}
