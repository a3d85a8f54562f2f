//! Platform capability profiles
//!
//! Low-power ARM boards need a lighter browser footprint and tighter
//! timeouts than a desktop. The profile is selected once at startup
//! and threaded through the session manager and the orchestrator so
//! no component does its own platform sniffing.

use std::time::Duration;

/// Broad capability class of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    /// Full-fidelity desktop or server.
    Desktop,
    /// Resource-constrained host (ARM single-board class).
    Constrained,
}

/// Platform-dependent configuration, selected once at startup.
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    pub kind: PlatformKind,
    /// Browser window size.
    pub viewport: (u32, u32),
    /// Timeout for a single page navigation.
    pub navigation_timeout: Duration,
    /// Passive wait after steering, letting client-side script run.
    pub settle_wait: Duration,
    /// Timeout for one HTTP request (segment or progressive chunk setup).
    pub request_timeout: Duration,
    /// Timeout for the metadata probe subprocess.
    pub probe_timeout: Duration,
    /// Minimum percentage step for progressive download reporting.
    pub progress_step: u8,
    /// Whether leftover browser processes are forcibly terminated when
    /// a graceful close does not confirm.
    pub force_process_cleanup: bool,
}

impl PlatformProfile {
    /// Detect the profile for the current host.
    pub fn detect() -> Self {
        Self::for_arch(std::env::consts::OS, std::env::consts::ARCH)
    }

    fn for_arch(os: &str, arch: &str) -> Self {
        let constrained = os == "linux" && (arch == "arm" || arch == "aarch64");
        if constrained {
            Self::constrained()
        } else {
            Self::desktop()
        }
    }

    /// Full-fidelity desktop profile.
    pub fn desktop() -> Self {
        Self {
            kind: PlatformKind::Desktop,
            viewport: (1920, 1080),
            navigation_timeout: Duration::from_secs(60),
            settle_wait: Duration::from_secs(12),
            request_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(15),
            progress_step: 10,
            force_process_cleanup: false,
        }
    }

    /// Reduced profile for ARM-class hosts: smaller viewport, shorter
    /// waits, and forced process cleanup after close.
    pub fn constrained() -> Self {
        Self {
            kind: PlatformKind::Constrained,
            viewport: (1280, 720),
            navigation_timeout: Duration::from_secs(30),
            settle_wait: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            progress_step: 10,
            force_process_cleanup: true,
        }
    }

    pub fn is_constrained(&self) -> bool {
        self.kind == PlatformKind::Constrained
    }
}
