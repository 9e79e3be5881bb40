//! Helpers for the external programs bagoup pipes data through.

use std::io::Write;
use std::process::{Command, Output, Stdio};

/// Run `cmd`, feeding `input` on stdin and capturing stdout and stderr.
///
/// Stdin is written from a separate thread so a child that starts writing
/// before it has consumed all of its input cannot deadlock us.
pub fn run_with_stdin(cmd: &mut Command, input: &[u8]) -> std::io::Result<Output> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdin = child.stdin.take();
    std::thread::scope(|s| {
        let writer = s.spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input)?;
            }
            Ok(())
        });
        let output = child.wait_with_output()?;
        match writer.join() {
            Ok(Ok(())) => Ok(output),
            // A child that exits early closes its stdin; its exit status says more.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(output),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::other("stdin writer thread panicked")),
        }
    })
}

/// Trimmed stderr of a finished process, or its exit status if it printed
/// nothing.
pub fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        stderr.to_string()
    }
}
