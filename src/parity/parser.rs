//! Parser for par2 command output

use super::traits::RepairEvent;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)] // literal pattern
static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Repairing:\W+(\d+(?:\.\d+)?)%").expect("valid regex"));

/// Exit status of an external command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The command exited successfully (exit code 0)
    Success,
    /// The command exited with a non-zero exit code
    Failure,
}

impl ExitStatus {
    /// Returns `true` if the exit status represents success
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<bool> for ExitStatus {
    fn from(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Map one line of `par2 r` output to the event it announces, if any
///
/// par2cmdline redraws progress with carriage returns, so callers should
/// split on `\r` as well as `\n`.
pub fn parse_repair_line(line: &str) -> Option<RepairEvent> {
    if let Some(caps) = PROGRESS.captures(line)
        && let Ok(percent) = caps[1].parse::<f32>()
    {
        return Some(RepairEvent::Progress { percent });
    }

    if line.contains("Repair complete") {
        return Some(RepairEvent::Repaired);
    }

    let lower = line.to_lowercase();
    if lower.contains("repair is not possible") {
        Some(RepairEvent::Broken)
    } else if lower.contains("repair is not required") {
        Some(RepairEvent::NotBroken)
    } else {
        None
    }
}

/// Tracks what a run has announced so far and decides how it finished
#[derive(Debug, Default)]
pub struct RepairOutcome {
    repaired: bool,
    not_broken: bool,
    broken: bool,
    error: Option<String>,
}

impl RepairOutcome {
    /// Feed one output line; returns the event it maps to
    pub fn observe(&mut self, line: &str) -> Option<RepairEvent> {
        if self.error.is_none() && line.to_lowercase().contains("error") {
            self.error = Some(line.trim().to_string());
        }

        let event = parse_repair_line(line)?;
        match event {
            RepairEvent::Repaired => self.repaired = true,
            RepairEvent::NotBroken => self.not_broken = true,
            RepairEvent::Broken => self.broken = true,
            _ => {}
        }
        Some(event)
    }

    /// First error line seen, for logging
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Closing events for the run
    ///
    /// The exit code is the source of truth. A failed run that never said so
    /// still gets an explicit `Broken` before `Finished`.
    pub fn finish(&self, exit_status: ExitStatus) -> Vec<RepairEvent> {
        let success = exit_status.is_success() && !self.broken;
        let mut events = Vec::new();
        if !success && !self.broken {
            events.push(RepairEvent::Broken);
        }
        events.push(RepairEvent::Finished { success });
        events
    }
}

/// Events for a complete, already captured `par2 r` run
pub fn parse_repair_output(stdout: &[u8], stderr: &[u8], exit_status: ExitStatus) -> Vec<RepairEvent> {
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    );

    let mut outcome = RepairOutcome::default();
    let mut events: Vec<RepairEvent> = combined
        .split(['\r', '\n'])
        .filter_map(|line| outcome.observe(line))
        .collect();
    events.extend(outcome.finish(exit_status));
    events
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_carry_percent() {
        assert_eq!(
            parse_repair_line("Repairing: 42.5%"),
            Some(RepairEvent::Progress { percent: 42.5 })
        );
        assert_eq!(
            parse_repair_line("Repairing:  7.0%"),
            Some(RepairEvent::Progress { percent: 7.0 })
        );
        assert_eq!(parse_repair_line("Loading \"file.par2\"."), None);
    }

    #[test]
    fn terminal_phrases_map_to_events() {
        assert_eq!(parse_repair_line("Repair complete."), Some(RepairEvent::Repaired));
        assert_eq!(
            parse_repair_line("All files are correct, repair is not required."),
            Some(RepairEvent::NotBroken)
        );
        assert_eq!(
            parse_repair_line("Repair is not possible."),
            Some(RepairEvent::Broken)
        );
    }

    #[test]
    fn real_success_output() {
        let stdout = b"Loading \"file.tar.vol000+577.PAR2\".\n\
                       Loaded 577 new packets\n\
                       Repair is required.\n\
                       Repairing: 10.0%\rRepairing: 55.5%\rRepairing: 100.0%\n\
                       Writing repaired data to disk.\n\
                       Repair complete.\n";
        let events = parse_repair_output(stdout, b"", ExitStatus::Success);

        assert_eq!(
            events,
            vec![
                RepairEvent::Progress { percent: 10.0 },
                RepairEvent::Progress { percent: 55.5 },
                RepairEvent::Progress { percent: 100.0 },
                RepairEvent::Repaired,
                RepairEvent::Finished { success: true },
            ]
        );
    }

    #[test]
    fn impossible_repair_finishes_unsuccessfully() {
        let stdout = b"You need 12 more recovery blocks to be able to repair.\n\
                       Repair is not possible.\n";
        let events = parse_repair_output(stdout, b"", ExitStatus::Failure);
        assert_eq!(
            events,
            vec![RepairEvent::Broken, RepairEvent::Finished { success: false }]
        );
    }

    #[test]
    fn silent_failure_still_reports_broken_once() {
        let mut outcome = RepairOutcome::default();
        assert!(outcome.observe("par2: fatal error: unable to read").is_none());
        assert_eq!(outcome.error(), Some("par2: fatal error: unable to read"));
        assert_eq!(
            outcome.finish(ExitStatus::Failure),
            vec![RepairEvent::Broken, RepairEvent::Finished { success: false }]
        );
    }

    #[test]
    fn intact_set_is_a_successful_run() {
        let events = parse_repair_output(
            b"All files are correct, repair is not required.\n",
            b"",
            ExitStatus::Success,
        );
        assert_eq!(
            events,
            vec![RepairEvent::NotBroken, RepairEvent::Finished { success: true }]
        );
    }

    #[test]
    fn garbage_output_follows_exit_code() {
        let events = parse_repair_output(b"\x00\xff ZZZ", b"", ExitStatus::Success);
        assert_eq!(events, vec![RepairEvent::Finished { success: true }]);
    }
}
