//! Acquisition loop: one remote trigger and one serial capture per sample.
//!
//! Per-sample flow: make sure the duty folder exists, fire the laser via a
//! detached [`CommandTask`], then read lines from the meter until the last
//! line matches the end-of-message pattern or the per-sample deadline
//! expires. The capture is parsed as JSON; a failed parse gets one recovery
//! pass that extracts a JSON object sitting after a few leading junk bytes
//! (the meter occasionally prefixes its output with boot noise). Only a
//! verified capture is written to disk, so a sample's target path either
//! holds valid JSON or does not exist.
//!
//! Samples run strictly one at a time. The trigger thread and the read loop
//! overlap on purpose, with no synchronization between them: the serial
//! stream itself is the only channel from the remote side. A discarded
//! sample drains the reader before the next firing, so a late transmission
//! can never be attributed to the wrong sample.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use regex::Regex;

use crate::plan::{self, Sample, DIR_MODE};
use crate::remote::{CommandTask, RemoteSession, TriggerCommand};
use crate::terminal::LineSource;

/// Default end-of-message pattern: a line that is a single closing brace.
pub const DEFAULT_END_PATTERN: &str = r"^\}$";

/// Recovery pattern: a JSON object starting after at most six leading
/// non-JSON characters, anchored at a line start anywhere in the capture.
const RECOVERY_PATTERN: &str = r"(?m)^[\s\S]{1,6}(\{[\s\S]*)$";

/// Default settle time between firings, letting the laser and sensor relax.
pub const DEFAULT_PACING: Duration = Duration::from_secs(2);

/// Poll interval while waiting for serial bytes.
const READ_POLL: Duration = Duration::from_millis(5);

/// Final state of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Valid JSON written to the target path.
    Persisted,
    /// Capture unusable; no file remains at the target path.
    Discarded,
}

/// Orchestrator owning the serial reader and the remote session for one run.
pub struct Collector<S: LineSource> {
    terminal: S,
    remote: RemoteSession,
    trigger: TriggerCommand,
    end_of_message: Regex,
    recovery: Regex,
    read_timeout: Duration,
    pacing: Duration,
}

impl<S: LineSource> Collector<S> {
    pub fn new(
        terminal: S,
        remote: RemoteSession,
        trigger: TriggerCommand,
        end_pattern: &str,
        read_timeout: Duration,
        pacing: Duration,
    ) -> Result<Self> {
        let end_of_message = Regex::new(end_pattern)
            .with_context(|| format!("invalid end-of-message pattern: {}", end_pattern))?;
        let recovery = Regex::new(RECOVERY_PATTERN).context("recovery pattern")?;
        Ok(Self {
            terminal,
            remote,
            trigger,
            end_of_message,
            recovery,
            read_timeout,
            pacing,
        })
    }

    /// Drive every sample to `Persisted` or `Discarded`, then close the port.
    ///
    /// Per-sample failures never abort the run; only local I/O faults
    /// (serial device gone, filesystem errors) propagate.
    pub fn run(&mut self, samples: &[Sample]) -> Result<()> {
        println!();
        println!("┌───────────────────────┐");
        println!("│ Begin Data Collection │");
        println!("└───────────────────────┘");
        println!();

        self.terminal.open()?;
        let total = samples.len();
        let mut persisted = 0usize;
        for (index, sample) in samples.iter().enumerate() {
            let outcome = self.run_sample(sample)?;
            if outcome == SampleOutcome::Persisted {
                persisted += 1;
            }
            println!("{}", plan::status_line(&sample.target(), index + 1, total));
            thread::sleep(self.pacing);
        }
        self.terminal.close();
        info!("run finished: {}/{} samples persisted", persisted, total);
        Ok(())
    }

    fn run_sample(&mut self, sample: &Sample) -> Result<SampleOutcome> {
        // Duty validation comes first: a bad duty must fail before any
        // directory or file is touched.
        let command = self.trigger.for_duty(sample.duty)?;
        ensure_duty_dir(&sample.directory)?;
        let target = sample.target();

        // Fire-and-forget: the trigger must be in flight before the read
        // starts, and its completion is only ever observed as light on the
        // serial side. The handle is dropped without a join.
        let _task = CommandTask::spawn(self.remote.clone(), command, |result| {
            if let Err(e) = result {
                warn!("remote trigger failed: {}", e);
            }
        })?;

        let captured = capture_transmission(
            &mut self.terminal,
            &self.end_of_message,
            self.read_timeout,
        )?;
        if captured.is_none() {
            error!(
                "no complete transmission within {:?} for {}",
                self.read_timeout,
                target.display()
            );
        }
        finalize_sample(&mut self.terminal, captured, &target, &self.recovery)
    }
}

/// Accumulate lines until the last one matches the end-of-message pattern.
/// `None` means the deadline expired first.
fn capture_transmission<S: LineSource>(
    source: &mut S,
    end_of_message: &Regex,
    read_timeout: Duration,
) -> Result<Option<String>> {
    let mut buffer = String::new();
    let deadline = Instant::now() + read_timeout;
    loop {
        if Instant::now() >= deadline {
            return Ok(None);
        }
        if source.bytes_available()? > 0 {
            if let Some(line) = source.read_line()? {
                buffer.push_str(&line);
                if line_terminates(end_of_message, &line) {
                    return Ok(Some(buffer));
                }
            }
        } else {
            thread::sleep(READ_POLL);
        }
    }
}

/// Persist or discard one capture, then leave the reader clean.
///
/// A discarded sample drains the source: whatever the previous firing still
/// has in flight must not be mistaken for the next sample's transmission.
fn finalize_sample<S: LineSource>(
    source: &mut S,
    captured: Option<String>,
    target: &Path,
    recovery: &Regex,
) -> Result<SampleOutcome> {
    let outcome = match captured {
        Some(buffer) => persist_capture(&buffer, target, recovery)?,
        None => {
            discard(target);
            SampleOutcome::Discarded
        }
    };
    if outcome == SampleOutcome::Discarded {
        source.drain()?;
    }
    Ok(outcome)
}

/// Whether a received line (endings stripped) matches the end pattern.
fn line_terminates(end_of_message: &Regex, line: &str) -> bool {
    end_of_message.is_match(line.trim_end_matches(['\r', '\n']))
}

fn ensure_duty_dir(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        DirBuilder::new()
            .mode(DIR_MODE)
            .create(directory)
            .with_context(|| format!("creating {}", directory.display()))?;
    }
    Ok(())
}

/// Validate a capture and write it, or make sure no file survives.
///
/// Stage one parses the trimmed buffer as-is; stage two extracts the object
/// group from the recovery pattern and parses that. Either success writes
/// the verified text verbatim. Both failing removes any file at the target
/// path and emits an unrecoverable diagnostic.
fn persist_capture(raw: &str, target: &Path, recovery: &Regex) -> Result<SampleOutcome> {
    let trimmed = raw.trim();
    let parse_err = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => {
            fs::write(target, trimmed)?;
            return Ok(SampleOutcome::Persisted);
        }
        Err(e) => e,
    };

    if let Some(object) = recovery.captures(raw).and_then(|c| c.get(1)) {
        let recovered = object.as_str().trim();
        match serde_json::from_str::<serde_json::Value>(recovered) {
            Ok(_) => {
                fs::write(target, recovered)?;
                return Ok(SampleOutcome::Persisted);
            }
            Err(e) => {
                discard(target);
                error!("Unrecoverable {} in {} {}", e, target.display(), recovered);
                return Ok(SampleOutcome::Discarded);
            }
        }
    }

    discard(target);
    error!("Unrecoverable {} in {} {}", parse_err, target.display(), trimmed);
    Ok(SampleOutcome::Discarded)
}

fn discard(target: &Path) {
    if target.exists() {
        let _ = fs::remove_file(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result as CollectorResult;
    use std::collections::VecDeque;

    /// Scripted stand-in for the serial reader: hands out queued lines and
    /// records drains.
    struct ScriptedPort {
        lines: VecDeque<String>,
        drains: usize,
    }

    impl ScriptedPort {
        fn new() -> Self {
            Self {
                lines: VecDeque::new(),
                drains: 0,
            }
        }

        fn queue(&mut self, lines: &[&str]) {
            self.lines.extend(lines.iter().map(|l| l.to_string()));
        }
    }

    impl LineSource for ScriptedPort {
        fn open(&mut self) -> CollectorResult<()> {
            Ok(())
        }

        fn bytes_available(&mut self) -> CollectorResult<u32> {
            Ok(self.lines.iter().map(|l| l.len() as u32).sum())
        }

        fn read_line(&mut self) -> CollectorResult<Option<String>> {
            Ok(self.lines.pop_front())
        }

        fn drain(&mut self) -> CollectorResult<()> {
            self.lines.clear();
            self.drains += 1;
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn recovery() -> Regex {
        Regex::new(RECOVERY_PATTERN).unwrap()
    }

    fn end() -> Regex {
        Regex::new(DEFAULT_END_PATTERN).unwrap()
    }

    #[test]
    fn end_pattern_matches_bare_closing_brace_line() {
        assert!(line_terminates(&end(), "}\n"));
        assert!(line_terminates(&end(), "}\r\n"));
        assert!(!line_terminates(&end(), "} \n"));
        assert!(!line_terminates(&end(), "\"lux\": 118}\n"));
    }

    #[test]
    fn capture_stops_at_end_of_message_line() {
        let mut port = ScriptedPort::new();
        port.queue(&["{\n", "\"duty\": 45\n", "}\n", "leftover\n"]);

        let buffer = capture_transmission(&mut port, &end(), Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(buffer, "{\n\"duty\": 45\n}\n");
        // Bytes past the end line stay queued for inspection by the caller.
        assert_eq!(port.lines.len(), 1);
    }

    #[test]
    fn capture_gives_up_at_the_deadline() {
        let mut port = ScriptedPort::new();
        port.queue(&["{\n", "\"duty\": 45\n"]);

        let captured =
            capture_transmission(&mut port, &end(), Duration::from_millis(30)).unwrap();
        assert!(captured.is_none());
    }

    #[test]
    fn timed_out_sample_does_not_contaminate_the_next_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = ScriptedPort::new();

        // Firing N stalled mid-transmission; its tail arrives late.
        port.queue(&["\"duty\": 20\n", "}\n"]);
        let first = dir.path().join("serial00.json");
        let outcome = finalize_sample(&mut port, None, &first, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Discarded);
        assert_eq!(port.drains, 1);
        assert!(port.lines.is_empty());
        assert!(!first.exists());

        // Firing N+1 produces a clean transmission and must be the only
        // thing the next capture sees.
        port.queue(&["{\n", "\"duty\": 21\n", "}\n"]);
        let buffer = capture_transmission(&mut port, &end(), Duration::from_secs(1))
            .unwrap()
            .unwrap();
        let second = dir.path().join("serial01.json");
        let outcome = finalize_sample(&mut port, Some(buffer), &second, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Persisted);

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&second).unwrap()).unwrap();
        assert_eq!(value["duty"], 21);
    }

    #[test]
    fn discarded_capture_drains_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = ScriptedPort::new();
        port.queue(&["tail of a garbled firing\n"]);

        let target = dir.path().join("serial02.json");
        let outcome = finalize_sample(
            &mut port,
            Some("no json here\n".to_string()),
            &target,
            &recovery(),
        )
        .unwrap();
        assert_eq!(outcome, SampleOutcome::Discarded);
        assert_eq!(port.drains, 1);
        assert!(port.lines.is_empty());
    }

    #[test]
    fn persisted_capture_leaves_the_reader_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = ScriptedPort::new();

        let target = dir.path().join("serial03.json");
        let outcome = finalize_sample(
            &mut port,
            Some("{\"a\":1}".to_string()),
            &target,
            &recovery(),
        )
        .unwrap();
        assert_eq!(outcome, SampleOutcome::Persisted);
        assert_eq!(port.drains, 0);
    }

    #[test]
    fn clean_capture_persists_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("serial00.json");
        let raw = "{\n\"duty\": 45,\n\"lux\": 118\n}\n";

        let outcome = persist_capture(raw, &target, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Persisted);

        let written = fs::read_to_string(&target).unwrap();
        assert_eq!(written, raw.trim());
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["duty"], 45);
    }

    #[test]
    fn leading_noise_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("serial01.json");

        let outcome = persist_capture("xx{\"a\":1}", &target, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Persisted);
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn noise_on_an_earlier_line_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("serial02.json");
        let raw = "boot\n\u{1b}[0m{\n\"duty\": 20,\n\"lux\": 3\n}\n";

        let outcome = persist_capture(raw, &target, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Persisted);
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(value["lux"], 3);
    }

    #[test]
    fn capture_without_json_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("serial03.json");
        // Simulate a leftover from an earlier run; discard must remove it.
        fs::write(&target, "stale").unwrap();

        let outcome = persist_capture("garbage with no object\n", &target, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Discarded);
        assert!(!target.exists());
    }

    #[test]
    fn truncated_object_is_discarded_after_recovery_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("serial04.json");

        let outcome = persist_capture("xx{\"duty\": 45,", &target, &recovery()).unwrap();
        assert_eq!(outcome, SampleOutcome::Discarded);
        assert!(!target.exists());
    }

    #[test]
    fn duty_dir_created_once_with_expected_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let duty_dir = dir.path().join("45_duty");
        ensure_duty_dir(&duty_dir).unwrap();
        assert!(duty_dir.is_dir());
        let mode = fs::metadata(&duty_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, DIR_MODE);

        // Second call is a no-op.
        ensure_duty_dir(&duty_dir).unwrap();
    }
}
