//! BLE scan cycle state machine
//!
//! Scanning runs in bounded cycles: scan for `scan_window`, pause for
//! `rescan_pause`, repeat. The coordinator drives the radio; this type only
//! tracks where in the cycle we are so state changes can be validated and
//! reported.

use crate::config::BleConfig;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Scan timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    /// How long one scan cycle lasts
    pub scan_window: Duration,
    /// Pause between cycles
    pub rescan_pause: Duration,
}

impl From<&BleConfig> for ScanSchedule {
    fn from(config: &BleConfig) -> Self {
        Self {
            scan_window: config.scan_timeout(),
            rescan_pause: config.rescan_interval(),
        }
    }
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// Actively scanning
    Scanning,
    /// Between cycles
    Paused,
}

/// Errors for scanner state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Scanner already scanning")]
    AlreadyScanning,
    #[error("Scanner not scanning")]
    NotScanning,
}

/// Tracks scan cycles
#[derive(Debug)]
pub struct BleScanner {
    state: ScannerState,
    schedule: ScanSchedule,
    cycles: u64,
    last_state_change: Instant,
}

impl BleScanner {
    pub fn new(schedule: ScanSchedule) -> Self {
        Self {
            state: ScannerState::Idle,
            schedule,
            cycles: 0,
            last_state_change: Instant::now(),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn schedule(&self) -> ScanSchedule {
        self.schedule
    }

    /// Completed or running scan cycles since creation
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Check if scanner is active (scanning or paused)
    pub fn is_active(&self) -> bool {
        self.state != ScannerState::Idle
    }

    /// Begin a scan cycle
    pub fn start_scanning(&mut self) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::Idle | ScannerState::Paused => {
                self.transition(ScannerState::Scanning);
                self.cycles += 1;
                Ok(())
            }
            ScannerState::Scanning => Err(ScannerError::AlreadyScanning),
        }
    }

    /// End the current cycle and wait for the next
    pub fn pause_scanning(&mut self) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::Scanning => {
                self.transition(ScannerState::Paused);
                Ok(())
            }
            _ => Err(ScannerError::NotScanning),
        }
    }

    /// Stop scanning; idempotent
    pub fn stop_scanning(&mut self) {
        if self.state != ScannerState::Idle {
            self.transition(ScannerState::Idle);
        }
    }

    pub fn time_since_state_change(&self) -> Duration {
        Instant::now().duration_since(self.last_state_change)
    }

    fn transition(&mut self, state: ScannerState) {
        tracing::trace!("Scanner {:?} -> {:?}", self.state, state);
        self.state = state;
        self.last_state_change = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> BleScanner {
        BleScanner::new(ScanSchedule::from(&BleConfig::default()))
    }

    #[test]
    fn test_schedule_from_config() {
        let schedule = ScanSchedule::from(&BleConfig::default());
        assert_eq!(schedule.scan_window, Duration::from_secs(10));
        assert_eq!(schedule.rescan_pause, Duration::from_secs(5));
    }

    #[test]
    fn test_scan_cycle_transitions() {
        let mut scanner = scanner();
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert!(!scanner.is_active());

        scanner.start_scanning().unwrap();
        assert_eq!(scanner.state(), ScannerState::Scanning);
        assert_eq!(
            scanner.start_scanning(),
            Err(ScannerError::AlreadyScanning)
        );

        scanner.pause_scanning().unwrap();
        assert_eq!(scanner.state(), ScannerState::Paused);
        assert!(scanner.is_active());

        scanner.start_scanning().unwrap();
        assert_eq!(scanner.cycles(), 2);

        scanner.stop_scanning();
        assert_eq!(scanner.state(), ScannerState::Idle);
        scanner.stop_scanning();
    }

    #[test]
    fn test_pause_requires_scanning() {
        let mut scanner = scanner();
        assert_eq!(scanner.pause_scanning(), Err(ScannerError::NotScanning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_since_state_change() {
        let mut scanner = scanner();
        scanner.start_scanning().unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(scanner.time_since_state_change(), Duration::from_secs(3));
    }
}
