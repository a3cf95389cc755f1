//! Ready-made stream processors for the common cases: collect output,
//! feed fixed input, keep a bounded stderr snapshot.

use std::io;

use anyhow::Context as _;
use cmdpipe_core::ErrorRecorder;
use cmdpipe_core::config::SnapshotConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::processor::{ReadProcessor, StreamProcessor, WriteProcessor};

const CHUNK_SIZE: usize = 8 * 1024;

/// Collect the whole stream as bytes.
pub fn collect_bytes() -> ReadProcessor<Vec<u8>> {
    StreamProcessor::read(|mut ctx| async move {
        let slot = ctx.slot();
        let mut out = Vec::new();
        ctx.stream_mut()
            .read_to_end(&mut out)
            .await
            .with_context(|| format!("reading {slot}"))?;
        Ok(out)
    })
}

/// Collect the whole stream as text. Invalid UTF-8 is replaced.
pub fn collect_string() -> ReadProcessor<String> {
    StreamProcessor::read(|mut ctx| async move {
        let slot = ctx.slot();
        let mut out = Vec::new();
        ctx.stream_mut()
            .read_to_end(&mut out)
            .await
            .with_context(|| format!("reading {slot}"))?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    })
}

/// Write `data` to the pipeline's stdin, then close it.
///
/// A child that exits without reading all of its input is not an error.
pub fn feed(data: impl Into<Vec<u8>>) -> WriteProcessor<()> {
    let data = data.into();
    StreamProcessor::write(move |ctx| async move {
        let mut stdin = ctx.into_stream();
        let written = async {
            stdin.write_all(&data).await?;
            stdin.shutdown().await
        }
        .await;
        match written {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe && !stdin.is_closed() => Ok(()),
            other => other.context("writing stdin"),
        }
    })
}

/// Keep a head/tail snapshot of the stream, as configured.
pub fn snapshot_stderr(config: SnapshotConfig) -> ReadProcessor<String> {
    StreamProcessor::read(move |mut ctx| async move {
        let mut recorder = ErrorRecorder::from_config(&config);
        record(ctx.stream_mut(), &mut recorder, None::<&mut tokio::io::Sink>)
            .await
            .context("reading stderr")?;
        Ok(recorder.to_string())
    })
}

/// Drain `reader` into `recorder`, copying every chunk to `tee` as well.
pub async fn record<R, W>(
    reader: &mut R,
    recorder: &mut ErrorRecorder,
    mut tee: Option<&mut W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        recorder.record(chunk);
        if let Some(out) = tee.as_deref_mut() {
            out.write_all(chunk).await?;
        }
    }
    recorder.finish();
    if let Some(out) = tee {
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_tees_and_summarises() {
        let input = b"one\n\ntwo\r\nthree".to_vec();
        let mut reader = input.as_slice();
        let mut recorder = ErrorRecorder::new(80, 1, 1);
        let mut copy = Vec::new();
        record(&mut reader, &mut recorder, Some(&mut copy)).await.unwrap();
        assert_eq!(copy, input);
        assert_eq!(recorder.to_string(), "one\n...\nthree");
    }
}
