//! Database Record
//!
//! The replicated configuration of one database: its topology, replication
//! definitions, access grants and connection strings. Records are only mutated
//! by applying committed cluster commands; every mutation here re-checks the
//! rules against the state as it is at apply time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::topology::DatabaseTopology;
use crate::replication::{
    ExternalReplicationDefinition, HubAccessGrant, HubDefinition, OngoingTask,
    ReplicationConnectionString, ReplicationError, ReplicationResult, SinkDefinition, TaskId,
};
use crate::security::thumbprints_equal;

/// Replicated configuration of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseRecord {
    pub name: String,
    pub topology: DatabaseTopology,
    #[serde(default)]
    pub hubs: Vec<HubDefinition>,
    /// Access grants keyed by lower-cased hub name
    #[serde(default)]
    pub hub_grants: BTreeMap<String, Vec<HubAccessGrant>>,
    #[serde(default)]
    pub sinks: Vec<SinkDefinition>,
    #[serde(default)]
    pub external_replications: Vec<ExternalReplicationDefinition>,
    #[serde(default)]
    pub connection_strings: BTreeMap<String, ReplicationConnectionString>,
    /// Log index of the last command that changed this record
    #[serde(default)]
    pub etag: u64,
}

fn grant_key(hub: &str) -> String {
    hub.to_ascii_lowercase()
}

impl DatabaseRecord {
    /// Create an empty record.
    pub fn new(name: impl Into<String>, topology: DatabaseTopology) -> Self {
        Self {
            name: name.into(),
            topology,
            hubs: Vec::new(),
            hub_grants: BTreeMap::new(),
            sinks: Vec::new(),
            external_replications: Vec::new(),
            connection_strings: BTreeMap::new(),
            etag: 0,
        }
    }

    /// Look up a hub by name (case-insensitive).
    pub fn hub(&self, name: &str) -> Option<&HubDefinition> {
        self.hubs.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Grants registered on a hub.
    pub fn grants(&self, hub: &str) -> &[HubAccessGrant] {
        self.hub_grants
            .get(&grant_key(hub))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find the grant for a certificate thumbprint.
    pub fn grant(&self, hub: &str, thumbprint: &str) -> Option<&HubAccessGrant> {
        self.grants(hub)
            .iter()
            .find(|g| thumbprints_equal(&g.certificate_thumbprint, thumbprint))
    }

    /// Look up a connection string by name.
    pub fn connection_string(&self, name: &str) -> Option<&ReplicationConnectionString> {
        self.connection_strings.get(name)
    }

    /// Every ongoing task, hubs first.
    pub fn ongoing_tasks(&self) -> Vec<OngoingTask> {
        self.hubs
            .iter()
            .cloned()
            .map(OngoingTask::Hub)
            .chain(self.sinks.iter().cloned().map(OngoingTask::Sink))
            .chain(
                self.external_replications
                    .iter()
                    .cloned()
                    .map(OngoingTask::External),
            )
            .collect()
    }

    /// Look up any task by id.
    pub fn task(&self, task_id: TaskId) -> Option<OngoingTask> {
        self.ongoing_tasks()
            .into_iter()
            .find(|t| t.task_id() == task_id)
    }

    // =========================================================================
    // APPLY-TIME MUTATIONS
    // =========================================================================

    /// Check that the grants of the hub `definition` updates still fit it.
    ///
    /// New hubs have no grants and always pass.
    pub fn check_hub_update(&self, definition: &HubDefinition) -> ReplicationResult<()> {
        if !definition.task_id.is_assigned() {
            return Ok(());
        }
        let Some(current) = self.hubs.iter().find(|h| h.task_id == definition.task_id) else {
            return Ok(());
        };
        for grant in self.grants(&current.name) {
            grant.validate(definition).map_err(|err| {
                ReplicationError::invalid_configuration(format!(
                    "grant '{}' on hub '{}' does not fit the new definition: {}",
                    grant.grant_name, current.name, err.message
                ))
            })?;
        }
        Ok(())
    }

    /// Create or update a hub. New hubs take `index` as their task id.
    pub fn put_hub(&mut self, mut definition: HubDefinition, index: u64) -> ReplicationResult<TaskId> {
        definition.validate_shape()?;
        let clash = self
            .hubs
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&definition.name));

        if definition.task_id.is_assigned() {
            let pos = self
                .hubs
                .iter()
                .position(|h| h.task_id == definition.task_id)
                .ok_or_else(|| {
                    ReplicationError::not_found(format!(
                        "hub task {} does not exist on database '{}'",
                        definition.task_id, self.name
                    ))
                })?;
            if clash.is_some_and(|c| c != pos) {
                return Err(ReplicationError::invalid_configuration(format!(
                    "a hub named '{}' already exists",
                    definition.name
                )));
            }
            self.check_hub_update(&definition)?;
            let previous = self.hubs[pos].name.clone();
            if !previous.eq_ignore_ascii_case(&definition.name) {
                if let Some(grants) = self.hub_grants.remove(&grant_key(&previous)) {
                    let renamed: Vec<_> = grants
                        .into_iter()
                        .map(|mut g| {
                            g.hub_name = definition.name.clone();
                            g
                        })
                        .collect();
                    self.hub_grants.insert(grant_key(&definition.name), renamed);
                }
            }
            let task_id = definition.task_id;
            self.hubs[pos] = definition;
            return Ok(task_id);
        }

        if clash.is_some() {
            return Err(ReplicationError::invalid_configuration(format!(
                "a hub named '{}' already exists",
                definition.name
            )));
        }
        definition.task_id = TaskId(index);
        self.hubs.push(definition);
        Ok(TaskId(index))
    }

    /// Register an access grant.
    pub fn add_grant(&mut self, grant: HubAccessGrant) -> ReplicationResult<()> {
        let hub = self.hub(&grant.hub_name).ok_or_else(|| {
            ReplicationError::not_found(format!(
                "hub '{}' does not exist on database '{}'",
                grant.hub_name, self.name
            ))
        })?;
        if hub.has_legacy_certificates() {
            return Err(ReplicationError::invalid_configuration(format!(
                "hub '{}' still carries inline certificates; remove them before registering access grants",
                hub.name
            )));
        }
        grant.validate(hub)?;
        if self.grant(&grant.hub_name, &grant.certificate_thumbprint).is_some() {
            return Err(ReplicationError::duplicate_grant(
                &grant.hub_name,
                &grant.certificate_thumbprint,
            ));
        }
        self.hub_grants
            .entry(grant_key(&grant.hub_name))
            .or_default()
            .push(grant);
        Ok(())
    }

    /// Remove an access grant.
    pub fn remove_grant(&mut self, hub: &str, thumbprint: &str) -> ReplicationResult<HubAccessGrant> {
        if self.hub(hub).is_none() {
            return Err(ReplicationError::not_found(format!(
                "hub '{}' does not exist on database '{}'",
                hub, self.name
            )));
        }
        let grants = self.hub_grants.entry(grant_key(hub)).or_default();
        let pos = grants
            .iter()
            .position(|g| thumbprints_equal(&g.certificate_thumbprint, thumbprint))
            .ok_or_else(|| {
                ReplicationError::not_found(format!(
                    "hub '{}' has no access grant for certificate {}",
                    hub, thumbprint
                ))
            })?;
        Ok(grants.remove(pos))
    }

    /// Create or update a sink. New sinks take `index` as their task id.
    pub fn put_sink(&mut self, mut definition: SinkDefinition, index: u64) -> ReplicationResult<TaskId> {
        if self.connection_string(&definition.connection_string_name).is_none() {
            return Err(ReplicationError::invalid_configuration(format!(
                "connection string '{}' does not exist",
                definition.connection_string_name
            )));
        }
        definition.url = None;
        let clash = self
            .sinks
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(&definition.name));

        if definition.task_id.is_assigned() {
            let pos = self
                .sinks
                .iter()
                .position(|s| s.task_id == definition.task_id)
                .ok_or_else(|| {
                    ReplicationError::not_found(format!(
                        "sink task {} does not exist on database '{}'",
                        definition.task_id, self.name
                    ))
                })?;
            if clash.is_some_and(|c| c != pos) {
                return Err(ReplicationError::invalid_configuration(format!(
                    "a sink named '{}' already exists",
                    definition.name
                )));
            }
            let task_id = definition.task_id;
            self.sinks[pos] = definition;
            return Ok(task_id);
        }

        if clash.is_some() {
            return Err(ReplicationError::invalid_configuration(format!(
                "a sink named '{}' already exists",
                definition.name
            )));
        }
        definition.task_id = TaskId(index);
        self.sinks.push(definition);
        Ok(TaskId(index))
    }

    /// Create or update an external replication.
    pub fn put_external(
        &mut self,
        mut definition: ExternalReplicationDefinition,
        index: u64,
    ) -> ReplicationResult<TaskId> {
        let cs = self
            .connection_string(&definition.connection_string_name)
            .ok_or_else(|| {
                ReplicationError::invalid_configuration(format!(
                    "connection string '{}' does not exist",
                    definition.connection_string_name
                ))
            })?;
        definition.database = cs.database.clone();
        let clash = self
            .external_replications
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(&definition.name));

        if definition.task_id.is_assigned() {
            let pos = self
                .external_replications
                .iter()
                .position(|e| e.task_id == definition.task_id)
                .ok_or_else(|| {
                    ReplicationError::not_found(format!(
                        "external replication task {} does not exist on database '{}'",
                        definition.task_id, self.name
                    ))
                })?;
            if clash.is_some_and(|c| c != pos) {
                return Err(ReplicationError::invalid_configuration(format!(
                    "an external replication named '{}' already exists",
                    definition.name
                )));
            }
            let task_id = definition.task_id;
            self.external_replications[pos] = definition;
            return Ok(task_id);
        }

        if clash.is_some() {
            return Err(ReplicationError::invalid_configuration(format!(
                "an external replication named '{}' already exists",
                definition.name
            )));
        }
        definition.task_id = TaskId(index);
        self.external_replications.push(definition);
        Ok(TaskId(index))
    }

    /// Create or replace a connection string.
    pub fn put_connection_string(&mut self, cs: ReplicationConnectionString) -> ReplicationResult<()> {
        cs.validate()?;
        for external in self
            .external_replications
            .iter_mut()
            .filter(|e| e.connection_string_name == cs.name)
        {
            external.database = cs.database.clone();
        }
        self.connection_strings.insert(cs.name.clone(), cs);
        Ok(())
    }

    /// Enable or disable a task.
    pub fn toggle_task(&mut self, task_id: TaskId, disabled: bool) -> ReplicationResult<()> {
        if let Some(h) = self.hubs.iter_mut().find(|h| h.task_id == task_id) {
            h.disabled = disabled;
        } else if let Some(s) = self.sinks.iter_mut().find(|s| s.task_id == task_id) {
            s.disabled = disabled;
        } else if let Some(e) = self
            .external_replications
            .iter_mut()
            .find(|e| e.task_id == task_id)
        {
            e.disabled = disabled;
        } else {
            return Err(self.missing_task(task_id));
        }
        Ok(())
    }

    /// Delete a task. Deleting a hub deletes its grants.
    pub fn delete_task(&mut self, task_id: TaskId) -> ReplicationResult<OngoingTask> {
        if let Some(pos) = self.hubs.iter().position(|h| h.task_id == task_id) {
            let hub = self.hubs.remove(pos);
            self.hub_grants.remove(&grant_key(&hub.name));
            return Ok(OngoingTask::Hub(hub));
        }
        if let Some(pos) = self.sinks.iter().position(|s| s.task_id == task_id) {
            return Ok(OngoingTask::Sink(self.sinks.remove(pos)));
        }
        if let Some(pos) = self
            .external_replications
            .iter()
            .position(|e| e.task_id == task_id)
        {
            return Ok(OngoingTask::External(self.external_replications.remove(pos)));
        }
        Err(self.missing_task(task_id))
    }

    fn missing_task(&self, task_id: TaskId) -> ReplicationError {
        ReplicationError::not_found(format!(
            "task {} does not exist on database '{}'",
            task_id, self.name
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::cluster::NodeTag;
    use crate::replication::{ReplicationErrorKind, ReplicationMode};
    use crate::security::{generate_certificate, parse_certificate};

    fn record() -> DatabaseRecord {
        DatabaseRecord::new("orders", DatabaseTopology::new(vec![NodeTag::new("A")]))
    }

    fn grant(hub: &str) -> HubAccessGrant {
        let generated = generate_certificate("sink", chrono::Duration::days(1)).unwrap();
        let parsed = parse_certificate(&generated.public_key).unwrap();
        HubAccessGrant {
            hub_name: hub.to_string(),
            grant_name: "sink-a".to_string(),
            certificate_thumbprint: parsed.info.thumbprint.clone(),
            certificate_public_info: parsed.info,
            allowed_hub_to_sink_paths: BTreeSet::new(),
            allowed_sink_to_hub_paths: BTreeSet::new(),
        }
    }

    #[test]
    fn test_new_hub_takes_log_index() {
        let mut rec = record();
        let id = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 42)
            .unwrap();
        assert_eq!(id, TaskId(42));
        assert_eq!(rec.hub("H1").unwrap().task_id, TaskId(42));
    }

    #[test]
    fn test_update_keeps_task_id() {
        let mut rec = record();
        let id = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 5)
            .unwrap();
        let mut updated = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        updated.task_id = id;
        updated.disabled = true;
        assert_eq!(rec.put_hub(updated, 9).unwrap(), TaskId(5));
        assert!(rec.hub("h1").unwrap().disabled);
        assert_eq!(rec.hubs.len(), 1);
    }

    #[test]
    fn test_duplicate_hub_name_rejected() {
        let mut rec = record();
        rec.put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 5)
            .unwrap();
        let err = rec
            .put_hub(HubDefinition::new("H1", ReplicationMode::HUB_TO_SINK), 6)
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_duplicate_grant_rejected() {
        let mut rec = record();
        rec.put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 5)
            .unwrap();
        let g = grant("h1");
        rec.add_grant(g.clone()).unwrap();
        let err = rec.add_grant(g).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::DuplicateGrant);
        assert_eq!(rec.grants("h1").len(), 1);
    }

    #[test]
    fn test_filtering_needs_paths_on_every_grant() {
        let mut rec = record();
        let id = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 5)
            .unwrap();
        rec.add_grant(grant("h1")).unwrap();

        let mut filtered = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        filtered.task_id = id;
        filtered.with_filtering = true;
        let err = rec.put_hub(filtered, 9).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
        assert!(err.message.contains("hub-to-sink"));
        assert!(!rec.hub("h1").unwrap().with_filtering);
    }

    #[test]
    fn test_dropping_sink_to_hub_conflicts_with_inbound_paths() {
        let mut rec = record();
        let id = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::all()), 5)
            .unwrap();
        let mut g = grant("h1");
        g.allowed_sink_to_hub_paths = BTreeSet::from(["inbox/*".to_string()]);
        rec.add_grant(g).unwrap();

        let mut narrowed = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        narrowed.task_id = id;
        assert!(rec.put_hub(narrowed, 9).is_err());
        assert_eq!(rec.hub("h1").unwrap().mode, ReplicationMode::all());
    }

    #[test]
    fn test_apply_rejects_directionless_hub() {
        let mut rec = record();
        let err = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::empty()), 5)
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_legacy_certificates_block_grants() {
        let mut rec = record();
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.legacy_certificates = vec!["MIIB...".to_string()];
        rec.put_hub(hub, 5).unwrap();
        let err = rec.add_grant(grant("h1")).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_delete_hub_removes_grants() {
        let mut rec = record();
        let id = rec
            .put_hub(HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK), 5)
            .unwrap();
        rec.add_grant(grant("h1")).unwrap();
        rec.delete_task(id).unwrap();
        assert!(rec.grants("h1").is_empty());
        assert!(rec.task(id).is_none());
    }

    #[test]
    fn test_sink_requires_connection_string() {
        let mut rec = record();
        let sink = SinkDefinition {
            name: "s1".into(),
            connection_string_name: "missing".into(),
            hub_name: "h1".into(),
            certificate_with_private_key: None,
            mode: ReplicationMode::HUB_TO_SINK,
            url: None,
            task_id: TaskId::default(),
            disabled: false,
            mentor_node: None,
        };
        assert!(rec.put_sink(sink, 3).is_err());
    }

    #[test]
    fn test_toggle_unknown_task() {
        let mut rec = record();
        let err = rec.toggle_task(TaskId(99), true).unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
    }
}
