//! Firewall backends
//!
//! Rules are installed by shelling out to the platform tool. Each rule is
//! tagged with its name so it can be found and removed again.

use std::net::IpAddr;
use std::process::Command;

use super::EnforcementError;
use crate::config::FirewallBackend;

pub trait Firewall: Send + Sync {
    /// Install an inbound block rule for `address`
    fn block(&self, address: &IpAddr, rule_name: &str) -> Result<(), EnforcementError>;

    /// Remove the rule installed by `block`
    fn unblock(&self, address: &IpAddr, rule_name: &str) -> Result<(), EnforcementError>;

    /// Whether calls actually change the host firewall
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Used when banning is switched off; every call is a logged no-op
#[derive(Debug, Default)]
pub struct DisabledFirewall;

impl Firewall for DisabledFirewall {
    fn block(&self, address: &IpAddr, _rule_name: &str) -> Result<(), EnforcementError> {
        log::debug!("Firewall banning is disabled; {} was not blocked", address);
        Ok(())
    }

    fn unblock(&self, address: &IpAddr, _rule_name: &str) -> Result<(), EnforcementError> {
        log::debug!("Firewall banning is disabled; nothing to remove for {}", address);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn new(program: &str, args: &[&str]) -> Self {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn run(&self) -> Result<std::process::Output, EnforcementError> {
        Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|source| EnforcementError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    fn run_checked(&self) -> Result<(), EnforcementError> {
        let output = self.run()?;
        if output.status.success() {
            return Ok(());
        }
        Err(EnforcementError::CommandFailed {
            program: self.program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// netsh advfirewall on Windows, iptables / ip6tables elsewhere
#[derive(Debug, Clone)]
pub struct CommandFirewall {
    backend: FirewallBackend,
}

impl CommandFirewall {
    /// `FirewallBackend::None` is rejected; use `DisabledFirewall` instead
    pub fn new(backend: FirewallBackend) -> Result<Self, EnforcementError> {
        match backend {
            FirewallBackend::None => Err(EnforcementError::NoBackend),
            _ => Ok(CommandFirewall { backend }),
        }
    }

    fn iptables(address: &IpAddr) -> &'static str {
        match address {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    fn iptables_rule(address: &IpAddr, op: &str, rule_name: &str) -> Invocation {
        let source = address.to_string();
        Invocation::new(
            Self::iptables(address),
            &[op, "INPUT", "-s", &source, "-m", "comment", "--comment", rule_name, "-j", "DROP"],
        )
    }

    /// Lookup that succeeds when the rule is already present
    pub(crate) fn exists_invocation(&self, address: &IpAddr, rule_name: &str) -> Invocation {
        match self.backend {
            FirewallBackend::Netsh => Invocation::new(
                "netsh",
                &["advfirewall", "firewall", "show", "rule", &format!("name={}", rule_name)],
            ),
            _ => Self::iptables_rule(address, "-C", rule_name),
        }
    }

    pub(crate) fn block_invocation(&self, address: &IpAddr, rule_name: &str) -> Invocation {
        match self.backend {
            FirewallBackend::Netsh => Invocation::new(
                "netsh",
                &[
                    "advfirewall",
                    "firewall",
                    "add",
                    "rule",
                    &format!("name={}", rule_name),
                    "dir=in",
                    "action=block",
                    &format!("remoteip={}", address),
                ],
            ),
            _ => Self::iptables_rule(address, "-I", rule_name),
        }
    }

    pub(crate) fn unblock_invocation(&self, address: &IpAddr, rule_name: &str) -> Invocation {
        match self.backend {
            FirewallBackend::Netsh => Invocation::new(
                "netsh",
                &["advfirewall", "firewall", "delete", "rule", &format!("name={}", rule_name)],
            ),
            _ => Self::iptables_rule(address, "-D", rule_name),
        }
    }

    fn rule_exists(&self, address: &IpAddr, rule_name: &str) -> Result<bool, EnforcementError> {
        Ok(self.exists_invocation(address, rule_name).run()?.status.success())
    }
}

impl Firewall for CommandFirewall {
    fn block(&self, address: &IpAddr, rule_name: &str) -> Result<(), EnforcementError> {
        if self.rule_exists(address, rule_name)? {
            log::debug!("Firewall rule {} already present", rule_name);
            return Ok(());
        }
        self.block_invocation(address, rule_name).run_checked()
    }

    fn unblock(&self, address: &IpAddr, rule_name: &str) -> Result<(), EnforcementError> {
        if !self.rule_exists(address, rule_name)? {
            log::debug!("Firewall rule {} not present", rule_name);
            return Ok(());
        }
        self.unblock_invocation(address, rule_name).run_checked()
    }
}
