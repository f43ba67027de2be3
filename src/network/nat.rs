//! Outbound NAT for bridge networks
//!
//! Masquerades traffic from a bridge subnet that leaves the host through any
//! other interface. Traffic between containers on the same bridge is not
//! rewritten.

use crate::error::{Error, Result};
use crate::exec;
use ipnet::Ipv4Net;
use std::time::Duration;
use tracing::{debug, info};

/// `-t nat POSTROUTING -s <subnet> ! -o <bridge> -j MASQUERADE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    pub subnet: Ipv4Net,
    pub bridge: String,
}

impl MasqueradeRule {
    pub fn new(subnet: Ipv4Net, bridge: &str) -> Self {
        Self {
            subnet: subnet.trunc(),
            bridge: bridge.to_string(),
        }
    }

    /// iptables arguments for `op` (`-C`, `-A` or `-D`)
    pub fn args(&self, op: &str) -> Vec<String> {
        let subnet = self.subnet.to_string();
        [
            "-t",
            "nat",
            op,
            "POSTROUTING",
            "-s",
            subnet.as_str(),
            "!",
            "-o",
            self.bridge.as_str(),
            "-j",
            "MASQUERADE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Installs and removes masquerade rules
pub trait NatControl {
    /// Install the rule unless an identical one is present
    fn ensure(&self, rule: &MasqueradeRule) -> Result<()>;

    /// Remove the rule if present
    fn remove(&self, rule: &MasqueradeRule) -> Result<()>;
}

/// `iptables` binary with a per-invocation deadline
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
    timeout: Duration,
}

impl Iptables {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn exists(&self, rule: &MasqueradeRule) -> Result<bool> {
        let out = exec::run(&self.binary, &rule.args("-C"), self.timeout)?;
        Ok(out.success)
    }

    fn apply(&self, rule: &MasqueradeRule, op: &str) -> Result<()> {
        let args = rule.args(op);
        let out = exec::run(&self.binary, &args, self.timeout)?;
        if !out.success {
            return Err(Error::CommandFailed {
                command: exec::display(&self.binary, &args),
                message: out.message(),
            });
        }
        Ok(())
    }
}

impl NatControl for Iptables {
    fn ensure(&self, rule: &MasqueradeRule) -> Result<()> {
        if self.exists(rule)? {
            debug!(subnet = %rule.subnet, bridge = %rule.bridge, "masquerade rule present");
            return Ok(());
        }
        self.apply(rule, "-A")?;
        info!(subnet = %rule.subnet, bridge = %rule.bridge, "masquerade rule installed");
        Ok(())
    }

    fn remove(&self, rule: &MasqueradeRule) -> Result<()> {
        if !self.exists(rule)? {
            debug!(subnet = %rule.subnet, bridge = %rule.bridge, "masquerade rule absent");
            return Ok(());
        }
        self.apply(rule, "-D")?;
        info!(subnet = %rule.subnet, bridge = %rule.bridge, "masquerade rule removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_rule_args() {
        let rule = MasqueradeRule::new("192.168.0.1/24".parse().unwrap(), "gangway0");
        assert_eq!(
            rule.args("-A").join(" "),
            "-t nat -A POSTROUTING -s 192.168.0.0/24 ! -o gangway0 -j MASQUERADE"
        );
    }

    /// Fake iptables that logs its arguments and fails `-C` until a rule is added
    fn fake_iptables(dir: &TempDir) -> (String, std::path::PathBuf) {
        let log = dir.path().join("calls.log");
        let state = dir.path().join("present");
        let script = dir.path().join("iptables");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$3\" >> {log}\ncase \"$3\" in\n  -C) [ -f {state} ] ;;\n  -A) touch {state} ;;\n  -D) rm -f {state} ;;\nesac\n",
                log = log.display(),
                state = state.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    #[test]
    fn test_ensure_and_remove_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let (binary, log) = fake_iptables(&dir);
        let nat = Iptables::new(binary, Duration::from_secs(5));
        let rule = MasqueradeRule::new("10.0.0.0/24".parse().unwrap(), "br0");

        nat.ensure(&rule).unwrap();
        nat.ensure(&rule).unwrap();
        nat.remove(&rule).unwrap();
        nat.remove(&rule).unwrap();

        let calls = fs::read_to_string(log).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec!["-C", "-A", "-C", "-C", "-D", "-C"]
        );
    }

    #[test]
    fn test_failed_append_is_reported() {
        let nat = Iptables::new("false", Duration::from_secs(5));
        let rule = MasqueradeRule::new("10.0.0.0/24".parse().unwrap(), "br0");
        assert!(matches!(
            nat.ensure(&rule),
            Err(Error::CommandFailed { .. })
        ));
    }
}
