//! Multiplexed pretty-printing of container log streams.
//!
//! One reader task per container consumes the engine's framed stream and
//! splits it into stdout/stderr lines; a single printer task serialises the
//! annotated lines to the caller's writer. Readers hand lines over through
//! an unbounded channel, so a slow stream never blocks its peers.

use std::io::Write;

use bollard::container::LogOutput;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::docker;
use crate::error::RunnerError;

/// Which half of the container's combined stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct LogLine {
    tag: String,
    source: Source,
    line: String,
}

/// Accumulates stream chunks and yields complete lines.
///
/// Frames from the engine do not align with line boundaries, so a partial
/// line is carried over until its terminator arrives; `flush` drains a
/// trailing unterminated line at end of stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        LineSplitter::default()
    }

    /// Feed a chunk, returning every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.buf.push(*byte);
            }
        }
        lines
    }

    /// Drain the remaining partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Render one annotated line. The tag is the first 12 characters of the
/// container id.
fn format_line(tag: &str, source: Source, line: &str) -> String {
    match source {
        Source::Stdout => format!("<< {tag} >> {line}\n"),
        Source::Stderr => format!("<< {tag} >> (stderr) {line}\n"),
    }
}

/// Shorten a container id to its display tag.
pub fn short_id(container_id: &str) -> String {
    container_id.chars().take(12).collect()
}

/// Fans in the log streams of many containers and pretty-prints them.
pub struct LogMultiplexer {
    readers: JoinSet<Result<(), RunnerError>>,
    tx: mpsc::UnboundedSender<LogLine>,
    printer: tokio::task::JoinHandle<()>,
    token: CancellationToken,
}

impl LogMultiplexer {
    /// Create a multiplexer writing annotated lines to `writer`.
    pub fn new(mut writer: Box<dyn Write + Send>, token: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
        let printer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let rendered = format_line(&entry.tag, entry.source, &entry.line);
                if let Err(e) = writer.write_all(rendered.as_bytes()) {
                    tracing::warn!(error = %e, "dropping log line, writer failed");
                }
            }
            let _ = writer.flush();
        });
        LogMultiplexer {
            readers: JoinSet::new(),
            tx,
            printer,
            token,
        }
    }

    /// Attach to a container's combined log stream.
    pub fn attach(&mut self, docker: &Docker, container_id: &str) {
        let docker = docker.clone();
        let id = container_id.to_string();
        let tag = short_id(container_id);
        let tx = self.tx.clone();
        let token = self.token.clone();

        self.readers.spawn(async move {
            let stream = docker::container_logs(&docker, &id, true);
            tokio::pin!(stream);

            let mut stdout = LineSplitter::new();
            let mut stderr = LineSplitter::new();
            let send = |source: Source, lines: Vec<String>| {
                for line in lines {
                    // The printer only stops once all readers are done, so
                    // a send failure means the run is being torn down.
                    let _ = tx.send(LogLine {
                        tag: tag.clone(),
                        source,
                        line,
                    });
                }
            };

            loop {
                tokio::select! {
                    _ = token.cancelled() => return Err(RunnerError::Cancelled),
                    frame = stream.next() => match frame {
                        Some(Ok(LogOutput::StdOut { message }))
                        | Some(Ok(LogOutput::Console { message })) => {
                            send(Source::Stdout, stdout.push(&message));
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            send(Source::Stderr, stderr.push(&message));
                        }
                        Some(Ok(LogOutput::StdIn { .. })) => {}
                        Some(Err(e)) => {
                            return Err(RunnerError::engine("container logs", &id, e));
                        }
                        None => {
                            send(Source::Stdout, stdout.flush().into_iter().collect());
                            send(Source::Stderr, stderr.flush().into_iter().collect());
                            return Ok(());
                        }
                    },
                }
            }
        });
    }

    /// Wait until every stream has ended.
    ///
    /// The first stream error (or cancellation) stops the remaining readers
    /// and is returned; the printer is always drained before returning.
    pub async fn wait(mut self) -> Result<(), RunnerError> {
        let mut first_err = None;
        while let Some(joined) = self.readers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        self.token.cancel();
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        tracing::error!(error = %e, "log reader task failed");
                        first_err = Some(RunnerError::Cancelled);
                        self.token.cancel();
                    }
                }
            }
        }
        drop(self.tx);
        let _ = self.printer.await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
