use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Context;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use ptyhub_protocol::TerminalSize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::factory::ExitInfo;
use crate::factory::ProcessEvent;
use crate::factory::ProcessFactory;
use crate::factory::PtyProcess;
use crate::factory::SpawnRequest;
use crate::factory::SpawnedProcess;

const READ_BUFFER_BYTES: usize = 8192;
/// How long the exit waiter lets the reader drain before reporting exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawns sessions on the host's native pty system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyFactory;

impl ProcessFactory for NativePtyFactory {
    fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedProcess> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(request.size))
            .context("failed to open pty")?;

        let config = &request.config;
        let mut command = CommandBuilder::new(&config.program);
        command.args(&config.args);
        if let Some(cwd) = config.cwd.as_deref() {
            command.cwd(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .with_context(|| format!("failed to spawn {}", config.program))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let killer = child.clone_killer();
        let process_id = child.process_id();
        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ProcessEvent>();
        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();

        let reader_events = events_tx.clone();
        let session_id = request.session_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_BYTES];
            let mut decoder = Utf8Accumulator::default();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        if !text.is_empty() && reader_events.send(ProcessEvent::Data(text)).is_err()
                        {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(ref e) if is_hangup(e) => break,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "pty read failed");
                        let _ = reader_events.send(ProcessEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                let _ = reader_events.send(ProcessEvent::Data(tail));
            }
            let _ = reader_done_tx.send(());
        });

        let session_id = request.session_id.clone();
        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => ExitInfo {
                    exit_code: Some(status.exit_code() as i32),
                    signal: status.signal().map(str::to_string),
                },
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "waiting on pty child failed");
                    let _ = events_tx.send(ProcessEvent::Error(e.to_string()));
                    ExitInfo::unknown()
                }
            };
            if reader_done_rx.recv_timeout(READER_DRAIN_TIMEOUT).is_err() {
                debug!(session_id = %session_id, "pty reader still open after exit");
            }
            let _ = events_tx.send(ProcessEvent::Exit(exit));
        });

        let writer_tx = spawn_writer(request.session_id.clone(), writer);

        Ok(SpawnedProcess {
            process: Box::new(NativePtyProcess {
                master: pair.master,
                writer_tx,
                killer,
                process_id,
            }),
            events: events_rx,
        })
    }
}

/// Feeds input to the pty off the runtime. The first failed write closes the
/// channel, so every later write reports the session as unwritable.
fn spawn_writer(
    session_id: String,
    writer: Box<dyn Write + Send>,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = Arc::new(StdMutex::new(writer));
    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            let writer = Arc::clone(&writer);
            let written = tokio::task::spawn_blocking(move || {
                let mut guard = writer
                    .lock()
                    .map_err(|_| std::io::Error::other("pty writer lock poisoned"))?;
                guard.write_all(&bytes)?;
                guard.flush()
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(session_id = %session_id, error = %err, "pty write failed");
                    break;
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "pty writer task failed");
                    break;
                }
            }
        }
    });
    writer_tx
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Linux reports EIO on the master once the slave side has gone away.
#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::BrokenPipe
}

struct NativePtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    process_id: Option<u32>,
}

impl PtyProcess for NativePtyProcess {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.writer_tx
            .send(data.to_vec())
            .map_err(|_| anyhow::anyhow!("pty writer closed"))
    }

    fn resize(&mut self, size: TerminalSize) -> anyhow::Result<()> {
        self.master.resize(pty_size(size))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> anyhow::Result<()> {
        // Hang-up, as when a terminal window closes; interactive shells
        // ignore SIGTERM.
        match self.process_id {
            Some(pid) => signal_process_group(pid, libc::SIGHUP),
            None => Ok(self.killer.kill()?),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> anyhow::Result<()> {
        Ok(self.killer.kill()?)
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        self.kill_process_group()?;
        if let Err(e) = self.killer.kill() {
            debug!(process_id = ?self.process_id, error = %e, "killer found no live child");
        }
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        self.process_id
    }
}

impl NativePtyProcess {
    #[cfg(unix)]
    fn kill_process_group(&self) -> anyhow::Result<()> {
        match self.process_id {
            Some(pid) => signal_process_group(pid, libc::SIGKILL),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The pty child is a session leader, so its pid doubles as its process
/// group id.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) -> anyhow::Result<()> {
    let pgid = libc::pid_t::try_from(pid).context("pid out of range")?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err.into())
}

/// Decodes a byte stream into UTF-8 text, holding back a trailing partial
/// code point until the rest of it arrives.
#[derive(Debug, Default)]
pub(crate) struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct HungUpWriter;

    impl Write for HungUpWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_write_closes_the_input_channel() {
        let tx = spawn_writer("claude:main:t1".to_string(), Box::new(HungUpWriter));
        tx.send(b"ls\r".to_vec()).expect("first write queued");
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .expect("writer stopped after the failed write");
        assert!(tx.send(b"pwd\r".to_vec()).is_err());
    }

    #[test]
    fn split_code_point_is_held_back() {
        let mut decoder = Utf8Accumulator::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut decoder = Utf8Accumulator::default();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn unterminated_sequence_is_flushed_lossily() {
        let mut decoder = Utf8Accumulator::default();
        assert_eq!(decoder.push(&[0xe2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
