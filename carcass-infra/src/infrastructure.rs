//! Infrastructure aggregate: one network plus the machines attached to it.

use std::fmt;

use carcass_hypervisor::{
    Domain, DomainState, HypervisorClient, HypervisorError, Network, ResourceKind,
};
use tracing::{info, instrument, warn};

use crate::error::InfraError;

/// What was done for a machine by a bulk operation.
#[derive(Debug)]
pub enum ControlAction {
    StartRequested,
    ShutdownRequested,
    /// Inactive and not forced, nothing requested
    Skipped,
    Failed(HypervisorError),
}

/// Outcome of a control operation for one machine.
#[derive(Debug)]
pub struct MachineOutcome {
    pub name: String,
    /// Live state read before acting
    pub state: DomainState,
    pub action: ControlAction,
}

impl MachineOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.action, ControlAction::Failed(_))
    }
}

impl fmt::Display for MachineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            ControlAction::StartRequested => write!(f, "{}: start requested", self.name),
            ControlAction::ShutdownRequested => write!(f, "{}: shutdown requested", self.name),
            ControlAction::Skipped => write!(f, "{}: not running", self.name),
            ControlAction::Failed(e) => write!(f, "{}: {}", self.name, e),
        }
    }
}

/// Per-machine outcomes of a control operation, in machine order.
#[derive(Debug, Default)]
pub struct ControlReport {
    pub outcomes: Vec<MachineOutcome>,
}

impl ControlReport {
    pub fn is_success(&self) -> bool {
        !self.outcomes.iter().any(MachineOutcome::is_failure)
    }

    pub fn failures(&self) -> impl Iterator<Item = &MachineOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    /// Names of the machines a start or shutdown was requested for.
    pub fn requested(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.action,
                    ControlAction::StartRequested | ControlAction::ShutdownRequested
                )
            })
            .map(|o| o.name.as_str())
            .collect()
    }

    pub fn extend(&mut self, other: ControlReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// A set of machines connected to a virtual network.
///
/// The snapshot is taken at lookup time. Control operations re-resolve each
/// machine by name and never wait for the requested state to be reached.
#[derive(Clone)]
pub struct Infrastructure {
    client: HypervisorClient,
    pub network: Network,
    pub machines: Vec<Domain>,
}

impl Infrastructure {
    /// Load the network named `name` and the machines attached to it.
    #[instrument(skip(client))]
    pub async fn lookup(client: &HypervisorClient, name: &str) -> Result<Self, InfraError> {
        let network = client
            .lookup_network(name)
            .await
            .map_err(|source| InfraError::Network {
                name: name.to_string(),
                source,
            })?;

        let machines = client
            .list_domains_by_network(&network)
            .await
            .map_err(|source| InfraError::Machines {
                name: name.to_string(),
                source,
            })?
            .into_items();

        Ok(Self {
            client: client.clone(),
            network,
            machines,
        })
    }

    /// Names of the machines, in order.
    pub fn machine_names(&self) -> impl Iterator<Item = &str> {
        self.machines.iter().map(|m| m.name.as_str())
    }

    /// Request the start of the machine `name`.
    pub async fn start(&self, name: &str) -> ControlReport {
        let mut report = ControlReport::default();
        match self.machines.iter().find(|m| m.name == name) {
            Some(m) => report.outcomes.push(self.start_machine(&m.name).await),
            None => report.outcomes.push(self.not_a_member(name)),
        }
        report
    }

    /// Request the start of every machine.
    pub async fn start_all(&self) -> ControlReport {
        let mut report = ControlReport::default();
        for m in &self.machines {
            report.outcomes.push(self.start_machine(&m.name).await);
        }
        report
    }

    /// Request the shutdown of the machine `name` when it is running, or in
    /// any case when `force` is set.
    pub async fn stop(&self, name: &str, force: bool) -> ControlReport {
        let mut report = ControlReport::default();
        match self.machines.iter().find(|m| m.name == name) {
            Some(m) => report.outcomes.push(self.stop_machine(&m.name, force).await),
            None => report.outcomes.push(self.not_a_member(name)),
        }
        report
    }

    /// Request the shutdown of every running machine, or of every machine
    /// when `force` is set.
    pub async fn stop_all(&self, force: bool) -> ControlReport {
        let mut report = ControlReport::default();
        for m in &self.machines {
            report.outcomes.push(self.stop_machine(&m.name, force).await);
        }
        report
    }

    fn not_a_member(&self, name: &str) -> MachineOutcome {
        warn!(machine = %name, network = %self.network.name, "No such machine on network");
        MachineOutcome {
            name: name.to_string(),
            state: DomainState::Unknown,
            action: ControlAction::Failed(HypervisorError::NotFound {
                kind: ResourceKind::Domain,
                name: name.to_string(),
            }),
        }
    }

    async fn start_machine(&self, name: &str) -> MachineOutcome {
        // The status only annotates the outcome, the start is requested anyway
        // unless the machine is gone.
        let state = match self.client.lookup_domain(name).await {
            Ok(dom) => DomainState::from(dom.active),
            Err(e) if e.is_not_found() => {
                return failed(name, DomainState::Unknown, "could not lookup domain", e)
            }
            Err(e) => {
                warn!(machine = %name, error = %e, "Could not get status of domain");
                DomainState::Unknown
            }
        };

        info!(machine = %name, "Request start");
        let action = match self.client.start_domain(name).await {
            Ok(()) => ControlAction::StartRequested,
            Err(e) => return failed(name, state, "could not start domain", e),
        };

        MachineOutcome {
            name: name.to_string(),
            state,
            action,
        }
    }

    async fn stop_machine(&self, name: &str, force: bool) -> MachineOutcome {
        let state = match self.client.lookup_domain(name).await {
            Ok(dom) => DomainState::from(dom.active),
            Err(e) => return failed(name, DomainState::Unknown, "could not get status of domain", e),
        };

        let action = if state == DomainState::Active || force {
            info!(machine = %name, force, "Request shutdown");
            match self.client.shutdown_domain(name).await {
                Ok(()) => ControlAction::ShutdownRequested,
                Err(e) => return failed(name, state, "could not shutdown domain", e),
            }
        } else {
            ControlAction::Skipped
        };

        MachineOutcome {
            name: name.to_string(),
            state,
            action,
        }
    }
}

fn failed(name: &str, state: DomainState, what: &str, e: HypervisorError) -> MachineOutcome {
    warn!(machine = %name, error = %e, "{}", what);
    MachineOutcome {
        name: name.to_string(),
        state,
        action: ControlAction::Failed(e),
    }
}
