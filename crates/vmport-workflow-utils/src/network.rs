//! Network rewrites applied to every instance a workflow creates.

use vmport_compute::NetworkInterface;
use vmport_workflow::{StepKind, Workflow};

/// Request no external IP on every network interface, including those of
/// included workflows.
///
/// An empty access config list (not an absent one) is what tells the API to
/// skip the default external NAT.
pub fn apply_no_external_ip(workflow: &mut Workflow) {
  workflow.visit_steps_mut(&mut |step| {
    if let StepKind::CreateInstances(defs) = &mut step.kind {
      for def in defs.iter_mut() {
        for interface in def.instance.network_interfaces.iter_mut() {
          interface.access_configs = Some(Vec::new());
        }
      }
    }
  });
}

/// The region a zone belongs to, e.g. `us-central1` for `us-central1-b`.
pub fn region_of(zone: &str) -> Option<&str> {
  zone.rsplit_once('-').map(|(region, _)| region)
}

/// User-selected network and subnetwork.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
  pub network: Option<String>,
  pub subnet: Option<String>,
}

impl NetworkSettings {
  pub fn new(network: Option<String>, subnet: Option<String>) -> Self {
    Self { network, subnet }
  }

  /// Fill in defaults and expand bare names to resource paths.
  ///
  /// With neither value set the `default` network is used. A subnet alone
  /// leaves the network empty so the API infers it from the subnet.
  pub fn resolve(&self, project: &str, zone: &str) -> Self {
    let network = match (&self.network, &self.subnet) {
      (None, None) => Some("default".to_string()),
      (network, _) => network.clone(),
    };
    let network = network.map(|n| {
      if n.contains('/') {
        n
      } else {
        format!("projects/{}/global/networks/{}", project, n)
      }
    });
    let subnet = self.subnet.as_ref().map(|s| {
      if s.contains('/') {
        s.clone()
      } else {
        let region = region_of(zone).unwrap_or(zone);
        format!("projects/{}/regions/{}/subnetworks/{}", project, region, s)
      }
    });
    Self { network, subnet }
  }

  /// Point every instance's interfaces at this network; instances without
  /// an interface get one.
  pub fn apply(&self, workflow: &mut Workflow) {
    workflow.visit_steps_mut(&mut |step| {
      if let StepKind::CreateInstances(defs) = &mut step.kind {
        for def in defs.iter_mut() {
          if def.instance.network_interfaces.is_empty() {
            def.instance.network_interfaces.push(NetworkInterface::default());
          }
          for interface in def.instance.network_interfaces.iter_mut() {
            interface.network = self.network.clone();
            interface.subnetwork = self.subnet.clone();
          }
        }
      }
    });
  }
}
