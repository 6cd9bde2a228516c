//! Splits a multiplexed attach/logs body into its stdout and stderr sinks.
//!
//! Frames are handled strictly one at a time: a frame's payload is written
//! to its sink before the next header is read, so a slow sink throttles the
//! network read instead of letting data pile up in memory.

use std::io::{Read, Write};

use berth_common::error::{BerthError, Result};

use crate::frame::{FrameReader, StreamTag};

/// Byte counts delivered by one demultiplexing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxSummary {
    /// Payload bytes written to the stdout sink.
    pub stdout_bytes: u64,
    /// Payload bytes written to the stderr sink.
    pub stderr_bytes: u64,
    /// Frames tagged stdin, which have no output sink and are skipped.
    pub skipped_frames: u64,
}

/// Copies every frame payload of `reader` to the sink matching its tag.
///
/// Runs until end of stream.
///
/// # Errors
///
/// Returns the first framing, read, or sink write error. Bytes already
/// written to the sinks stay written.
pub fn demultiplex<R, O, E>(reader: R, stdout: &mut O, stderr: &mut E) -> Result<DemuxSummary>
where
    R: Read,
    O: Write + ?Sized,
    E: Write + ?Sized,
{
    let mut frames = FrameReader::new(reader);
    let mut summary = DemuxSummary::default();

    while let Some((tag, payload)) = frames.next_frame()? {
        let len = payload.len() as u64;
        match tag {
            StreamTag::Stdout => {
                write_payload(stdout, payload)?;
                summary.stdout_bytes += len;
            }
            StreamTag::Stderr => {
                write_payload(stderr, payload)?;
                summary.stderr_bytes += len;
            }
            StreamTag::Stdin => {
                tracing::trace!(len, "skipping stdin-tagged frame");
                summary.skipped_frames += 1;
            }
        }
    }

    tracing::debug!(
        stdout = summary.stdout_bytes,
        stderr = summary.stderr_bytes,
        "multiplexed stream finished"
    );
    Ok(summary)
}

/// Copies an unframed (tty) body straight to `stdout`.
///
/// # Errors
///
/// Returns the first read or write error.
pub fn passthrough<R, O>(mut reader: R, stdout: &mut O) -> Result<DemuxSummary>
where
    R: Read,
    O: Write + ?Sized,
{
    let copied =
        std::io::copy(&mut reader, stdout).map_err(|e| BerthError::io("copying tty stream", e))?;
    stdout
        .flush()
        .map_err(|e| BerthError::io("flushing stdout sink", e))?;
    Ok(DemuxSummary {
        stdout_bytes: copied,
        ..DemuxSummary::default()
    })
}

/// Routes a body through [`demultiplex`], or [`passthrough`] when the
/// stream was opened in tty mode.
///
/// # Errors
///
/// Propagates the error of whichever path runs.
pub fn copy_output<R, O, E>(reader: R, tty: bool, stdout: &mut O, stderr: &mut E) -> Result<DemuxSummary>
where
    R: Read,
    O: Write + ?Sized,
    E: Write + ?Sized,
{
    if tty {
        passthrough(reader, stdout)
    } else {
        demultiplex(reader, stdout, stderr)
    }
}

fn write_payload<W: Write + ?Sized>(sink: &mut W, payload: &[u8]) -> Result<()> {
    sink.write_all(payload)
        .and_then(|()| sink.flush())
        .map_err(|e| BerthError::io("writing frame payload", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    use berth_common::error::FrameError;
    use proptest::prelude::*;

    use crate::frame::encode;

    fn framed(frames: &[(StreamTag, &[u8])]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|(tag, payload)| encode(*tag, payload).expect("encode"))
            .collect()
    }

    #[test]
    fn routes_payloads_by_tag() {
        let input = framed(&[
            (StreamTag::Stdout, b"hello "),
            (StreamTag::Stderr, b"warn\n"),
            (StreamTag::Stdout, b"world\n"),
        ]);
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let summary = demultiplex(&input[..], &mut out, &mut err).expect("demux");

        assert_eq!(out, b"hello world\n");
        assert_eq!(err, b"warn\n");
        assert_eq!(summary.stdout_bytes, 12);
        assert_eq!(summary.stderr_bytes, 5);
    }

    #[test]
    fn stdin_frames_are_skipped() {
        let input = framed(&[(StreamTag::Stdin, b"typed"), (StreamTag::Stdout, b"ok")]);
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let summary = demultiplex(&input[..], &mut out, &mut err).expect("demux");

        assert_eq!(out, b"ok");
        assert!(err.is_empty());
        assert_eq!(summary.skipped_frames, 1);
    }

    #[test]
    fn truncated_stream_keeps_earlier_output_and_fails() {
        let mut input = framed(&[(StreamTag::Stdout, b"complete")]);
        input.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 9, b'x']);
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let result = demultiplex(&input[..], &mut out, &mut err);

        assert!(matches!(
            result,
            Err(BerthError::Framing(FrameError::TruncatedPayload { expected: 9, got: 1 }))
        ));
        assert_eq!(out, b"complete");
        assert!(err.is_empty());
    }

    #[test]
    fn tty_mode_copies_raw_bytes() {
        let raw = b"\x01\x00\x00\x00 not a frame";
        let (mut out, mut err) = (Vec::new(), Vec::new());

        let summary = copy_output(&raw[..], true, &mut out, &mut err).expect("copy");

        assert_eq!(out, raw);
        assert!(err.is_empty());
        assert_eq!(summary.stdout_bytes, raw.len() as u64);
    }

    proptest! {
        #[test]
        fn per_sink_order_survives_any_interleaving(
            frames in proptest::collection::vec(
                (any::<bool>(), proptest::collection::vec(any::<u8>(), 0..64)),
                0..32,
            )
        ) {
            let mut input = Vec::new();
            let (mut want_out, mut want_err) = (Vec::new(), Vec::new());
            for (is_stdout, payload) in &frames {
                let tag = if *is_stdout { StreamTag::Stdout } else { StreamTag::Stderr };
                input.extend(encode(tag, payload).expect("encode"));
                if *is_stdout {
                    want_out.extend_from_slice(payload);
                } else {
                    want_err.extend_from_slice(payload);
                }
            }

            let (mut out, mut err) = (Vec::new(), Vec::new());
            let _ = demultiplex(&input[..], &mut out, &mut err).expect("demux");

            prop_assert_eq!(out, want_out);
            prop_assert_eq!(err, want_err);
        }
    }
}
