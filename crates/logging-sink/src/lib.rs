//! Best-effort discard of a child process's remaining output once its
//! client has gone away.
//!
//! When a comm client disconnects mid-stream, the comm handler keeps
//! reading the child's stdout/stderr to EOF so the child can finish and
//! no descriptor or zombie is leaked (see the daemon's stream-drain
//! policy). [`drain_to_null`] is the small, allocation-free loop that
//! does that reading without anywhere to send the bytes.

use std::io::{self, Read};

/// Size of the scratch buffer used to read-and-discard.
const DRAIN_BUF_LEN: usize = 4096;

/// Reads `reader` to EOF, discarding everything. I/O errors end the
/// drain early rather than propagating — by the time a connection is
/// being drained, the client is already gone and there is no one left to
/// report an error to; the caller still proceeds to `wait()` the child.
pub fn drain_to_null<R: Read>(reader: &mut R) {
    let mut buf = [0u8; DRAIN_BUF_LEN];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_a_reader_fully() {
        let data = vec![b'x'; DRAIN_BUF_LEN * 3 + 17];
        let mut cursor = data.as_slice();
        drain_to_null(&mut cursor);
        assert!(cursor.is_empty());
    }

    #[test]
    fn drains_an_already_empty_reader() {
        let mut empty: &[u8] = &[];
        drain_to_null(&mut empty);
    }
}
