//! Subject capability probing and kernel version handling.
//!
//! The capability set is computed at most once per run by invoking the
//! subject binary's `--info` self-report and scanning for fixed marker
//! substrings. Tests execute sequentially, so a one-shot cell is all the
//! synchronization this needs.

use once_cell::sync::OnceCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::process::{Command, Stdio};

/// Closed set of feature names tests may require, with the `--info` output
/// substring whose presence means "supported". An unknown name in a test
/// file is a parse error, not a skip.
pub const KNOWN_FEATURES: &[(&str, &str)] = &[
    ("aot", "aot: yes"),
    ("btf", "btf: yes"),
    ("dpath", "dpath: yes"),
    ("dwarf", "liblldb (DWARF support): yes"),
    ("get_func_ip", "get_func_ip: yes"),
    ("get_tai_ns", "get_ktime_ns: yes"),
    ("iter:task", "iter:task: yes"),
    ("iter:task_file", "iter:task_file: yes"),
    ("jiffies64", "jiffies64: yes"),
    ("kfunc", "kfunc: yes"),
    ("kprobe_multi", "kprobe_multi: yes"),
    ("libpath_resolv", "bcc library path resolution: yes"),
    ("loop", "Loop support: yes"),
    ("probe_read_kernel", "probe_read_kernel: yes"),
    ("signal", "send_signal: yes"),
    ("skboutput", "skboutput: yes"),
    ("uprobe_multi", "uprobe_multi: yes"),
    (
        "uprobe_refcount",
        "uprobe refcount (depends on Build:bcc bpf_attach_uprobe refcount): yes",
    ),
];

static CAPABILITIES: OnceCell<HashMap<&'static str, bool>> = OnceCell::new();

/// Whether `name` belongs to the closed known-feature set.
pub fn is_known(name: &str) -> bool {
    KNOWN_FEATURES.iter().any(|(known, _)| *known == name)
}

/// Capability map of the subject binary, probed once per process.
///
/// The probe runs `<subject> --info` and searches its combined output for
/// each feature's marker substring. The result is cached for the lifetime
/// of the run and never invalidated.
pub fn capabilities(subject: &str) -> std::io::Result<&'static HashMap<&'static str, bool>> {
    CAPABILITIES.get_or_try_init(|| {
        let probe = Command::new(subject)
            .arg("--info")
            .stdin(Stdio::null())
            .output()?;
        let mut text = String::from_utf8_lossy(&probe.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&probe.stderr));
        Ok(KNOWN_FEATURES
            .iter()
            .map(|(name, marker)| (*name, text.contains(marker)))
            .collect())
    })
}

/// A dotted kernel release, compared component-wise numerically.
///
/// Trailing non-numeric parts (`-rc3`, vendor suffixes) are ignored past
/// their leading digits, matching loose dotted-version ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion(Vec<u64>);

impl KernelVersion {
    pub fn parse(release: &str) -> Self {
        let mut components = Vec::new();
        for part in release.split(['.', '-']) {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            match digits.parse::<u64>() {
                Ok(n) => components.push(n),
                Err(_) => break,
            }
        }
        KernelVersion(components)
    }

    /// Release of the running kernel.
    pub fn current() -> std::io::Result<Self> {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
        Ok(Self::parse(release.trim()))
    }
}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
