//! C5/C7: the supervisor's dispatch loop and shutdown sequence, the heart
//! of the manager, grounded on `endpoint_manager.py`'s `_event_loop` /
//! `start` / `wait_for_children`, with the thread topology taken from
//! `vinit/src/bin/simplevisor.rs`'s `Supervisor`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getgid, getpgid, getuid, setresgid, setresuid, Gid, Pid, Uid};

use crate::config::Config;
use crate::error::CommandError;
use crate::failure_notice;
use crate::identity::{IdentityMapper, LocalIdentity};
use crate::launch::{start_endpoint, StartEndpointRequest};
use crate::registry::{CachedStartArgs, ChildRecord, ChildRegistry, StartArgsCache};
use crate::signals::SignalFlags;
use crate::transport::command_queue::{CommandQueueSubscriber, Delivery};
use crate::transport::result_publisher::ResultPublisher;
use crate::user_config::UserConfigRenderer;
use crate::wire::{CommandMessage, EpStatusReport, StartEndpointKwargs};

/// Commands accepted from the control plane. `spec.md` §4.5: only names
/// matching `^cmd_[A-Za-z][0-9A-Za-z_]{0,99}$` are even considered.
const VALID_COMMAND_PATTERN_MAX_LEN: usize = 100;

/// Ignore any command whose server-side timestamp skews from local time
/// by more than this, matching `endpoint_manager.py`'s 180s gate.
const MAX_CLOCK_SKEW_SECONDS: i64 = 180;

pub struct Manager {
    pub config: Config,
    pub config_dir: PathBuf,
    pub endpoint_id: String,
    pub identity_mapper: Option<Box<dyn IdentityMapper>>,
    pub own_identity: LocalIdentity,
    pub command_queue: Arc<dyn CommandQueueSubscriber>,
    pub result_publisher: Arc<dyn ResultPublisher>,
    pub heartbeat_routing_key: String,

    user_config_template: String,
    user_config_schema: Option<serde_json::Value>,
    user_config_renderer: Box<dyn UserConfigRenderer>,

    registry: ChildRegistry,
    start_args_cache: StartArgsCache,
    signal_flags: SignalFlags,
    time_to_stop: bool,
    /// Identities trusted to issue commands when no identity mapper is
    /// configured (unprivileged single-tenant deployments).
    parent_identities: HashSet<String>,
}

impl Manager {
    pub fn new(
        config: Config,
        config_dir: PathBuf,
        endpoint_id: String,
        identity_mapper: Option<Box<dyn IdentityMapper>>,
        own_identity: LocalIdentity,
        command_queue: Arc<dyn CommandQueueSubscriber>,
        result_publisher: Arc<dyn ResultPublisher>,
        heartbeat_routing_key: String,
        parent_identities: HashSet<String>,
        signal_flags: SignalFlags,
        user_config_template: String,
        user_config_schema: Option<serde_json::Value>,
        user_config_renderer: Box<dyn UserConfigRenderer>,
    ) -> Self {
        let ttl = Duration::from_secs(config.mu_child_ep_grace_period_s);
        Manager {
            config,
            config_dir,
            endpoint_id,
            identity_mapper,
            own_identity,
            command_queue,
            result_publisher,
            heartbeat_routing_key,
            user_config_template,
            user_config_schema,
            user_config_renderer,
            registry: ChildRegistry::new(),
            start_args_cache: StartArgsCache::new(ttl),
            signal_flags,
            time_to_stop: false,
            parent_identities,
        }
    }

    /// The main dispatch loop (`spec.md` §4.5). Returns when shutdown has
    /// been requested, either by signal or by the command stream ending.
    pub fn run(&mut self, deliveries: crossbeam_channel::Receiver<Delivery>) {
        let mut last_heartbeat = Instant::now() - Duration::from_secs(3600);
        let heartbeat_period = Duration::from_secs_f64(self.config.heartbeat_period_effective());

        while !self.time_to_stop {
            if self.signal_flags.take_shutdown_requested() {
                self.time_to_stop = true;
                break;
            }
            if self.signal_flags.take_child_may_have_exited() {
                self.wait_for_children();
            }

            if let Some(mapper) = self.identity_mapper.as_mut() {
                mapper.poll_reload();
            }

            if last_heartbeat.elapsed() >= heartbeat_period {
                self.send_heartbeat(false);
                last_heartbeat = Instant::now();
            }

            match deliveries.recv_timeout(Duration::from_secs(1)) {
                Ok(delivery) => {
                    let _ = self.command_queue.ack(delivery.delivery_tag);
                    self.handle_delivery(delivery);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.time_to_stop = true;
                }
            }
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        let command = match decode_command(&delivery.properties, &delivery.body) {
            Ok(command) => command,
            Err(reason) => {
                tracing::error!(reason = %reason, "rejecting command");
                self.send_failure_notice(None, &reason);
                return;
            }
        };

        if delivery.properties.debug_requested() {
            tracing::warn!(
                delivery_tag = delivery.delivery_tag,
                command = ?command.command,
                "command debug requested (credentials redacted)"
            );
        }

        // A missing timestamp is rejected, not waved through: the original's
        // `abs(now - timestamp)` check has no "timestamp absent" exemption.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let fresh = delivery
            .properties
            .timestamp
            .is_some_and(|server_ts| (now - server_ts).abs() <= MAX_CLOCK_SKEW_SECONDS);
        if !fresh {
            tracing::warn!(
                server_ts = ?delivery.properties.timestamp,
                now,
                "ignoring command from server: too old, clock skew too large, or missing timestamp"
            );
            self.send_failure_notice(
                Some(&command),
                "ignoring command from server: too old, clock skew too large, or missing timestamp",
            );
            return;
        }

        let identity_set = &command.globus_identity_set;

        // `spec.md` §4.5 step 6: a manager with no identity mapper (no
        // capability to change uid) only trusts identities linked to its
        // own auth; a privileged manager always consults the mapper.
        let local_identity = if self.identity_mapper.is_none() {
            let matches_parent = identity_set
                .iter()
                .any(|ident| self.parent_identities.contains(&ident.sub));
            if !matches_parent {
                tracing::error!("ignoring start request for untrusted identity");
                self.send_failure_notice(Some(&command), "untrusted identity");
                return;
            }
            self.own_identity.clone()
        } else {
            let mapper = self.identity_mapper.as_ref().unwrap();
            match mapper.map_identity(identity_set) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::error!(error = %e, "identity failed to map to a local user");
                    self.send_failure_notice(Some(&command), &e.to_string());
                    return;
                }
            }
        };

        match self.dispatch_command(&command, &local_identity) {
            Ok(()) => {
                tracing::info!(user = %local_identity.username, "command dispatched");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to execute command");
                self.send_failure_notice(Some(&command), &e.to_string());
            }
        }
    }

    fn dispatch_command(
        &mut self,
        command: &CommandMessage,
        local_identity: &LocalIdentity,
    ) -> Result<(), CommandError> {
        let name = command.command.as_deref();
        if !is_valid_command_name(name) {
            return Err(CommandError::InvalidCommand(command.command.clone()));
        }
        match name {
            Some("cmd_start_endpoint") => {
                self.cmd_start_endpoint(command, local_identity)?;
                Ok(())
            }
            _ => Err(CommandError::InvalidCommand(command.command.clone())),
        }
    }

    fn cmd_start_endpoint(
        &mut self,
        command: &CommandMessage,
        local_identity: &LocalIdentity,
    ) -> Result<(), CommandError> {
        let kwargs: StartEndpointKwargs =
            serde_json::from_value(serde_json::Value::Object(command.kwargs.clone()))
                .map_err(|_| CommandError::InvalidCommand(command.command.clone()))?;
        let name = kwargs.name.clone().ok_or(crate::error::LaunchError::MissingName)?;

        // `spec.md` §4.6: a start request for an endpoint that is already
        // running is treated as "revive me if I'm about to die" rather
        // than forking a duplicate.
        if let Some(existing_pid) = self.registry.pid_for_endpoint(&name) {
            tracing::info!(
                endpoint = %name,
                pid = existing_pid.as_raw(),
                "user endpoint already running; caching arguments in case it's about to shut down"
            );
            self.start_args_cache.insert(
                existing_pid,
                CachedStartArgs {
                    local_username: local_identity.username.clone(),
                    endpoint_name: name,
                    command: command.clone(),
                },
            );
            return Ok(());
        }

        // `endpoint_manager.py`: `self._allow_same_user = not privileged`, so
        // this refusal only applies to a privileged manager (one with an
        // identity mapper) absent the force flag. An unprivileged manager
        // always resolves `local_identity` to its own identity (`spec.md`
        // §4.5 step 6), so gating on uid equality alone would reject every
        // start it ever attempts.
        let privileged = self.identity_mapper.is_some();
        if privileged
            && local_identity.uid == self.own_identity.uid
            && !self.config.force_mu_allow_same_user
        {
            return Err(crate::error::LaunchError::SameUser {
                uid: local_identity.uid,
                uname: local_identity.username.clone(),
            }
            .into());
        }

        let rendered_config = self.user_config_renderer.render(
            &self.user_config_template,
            self.user_config_schema.as_ref(),
            &kwargs.user_opts,
        )?;
        let stdin_payload = serde_json::to_string(&serde_json::json!({
            "amqp_creds": kwargs.amqp_creds,
            "config": rendered_config,
        }))
        .map_err(|e| crate::error::LaunchError::TemplateRender(e.to_string()))?;

        // `spec.md` §4.6 step 22: `["globus-compute-endpoint", "start",
        // ep_name, "--die-with-parent", *args]` — the command's own extra
        // CLI tail is forwarded verbatim after the fixed prefix.
        let mut argv = vec![
            "globus-compute-endpoint".to_string(),
            "start".to_string(),
            name.clone(),
            "--die-with-parent".to_string(),
        ];
        argv.extend(command.args.iter().cloned());

        let request = StartEndpointRequest {
            identity: local_identity.clone(),
            endpoint_name: name.clone(),
            globus_compute_dir_name: ".globus_compute".into(),
            argv,
            config_dir: self.config_dir.clone(),
            stdin_payload,
            umask: 0o077,
        };

        let pid = start_endpoint(request).map_err(crate::error::LaunchError::from)?;

        // Deliberately no `start_args_cache` insert here: the cache is only
        // seeded in the already-running branch above, when a *second* start
        // request arrives for a name that's already live. Caching on every
        // fresh launch would make `wait_for_children` revive every cleanly
        // exiting endpoint unconditionally instead of only the ones a
        // revival request actually arrived for (`spec.md` §8 "revival is
        // attempted exactly once per cached-args insert").
        self.registry.insert(ChildRecord {
            pid,
            local_user_info: Some(local_identity.clone()),
            endpoint_name: name,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// `wait_for_children` (`spec.md` §4.5/§8): reap every exited child,
    /// and revive any that exited cleanly within the cache's grace period.
    fn wait_for_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(WaitStatus::Exited(pid, 0)) => {
                    self.registry.remove(pid);
                    if let Some(cached) = self.start_args_cache.take(pid) {
                        if !self.time_to_stop {
                            self.revive_child(cached);
                        }
                    }
                }
                Ok(WaitStatus::Exited(pid, code)) => {
                    tracing::warn!(pid = pid.as_raw(), code, "child exited with nonzero status");
                    self.registry.remove(pid);
                    self.start_args_cache.take(pid);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    tracing::warn!(pid = pid.as_raw(), ?signal, "child terminated by signal");
                    self.registry.remove(pid);
                    self.start_args_cache.take(pid);
                }
                Ok(_) => continue,
            }
        }
    }

    fn revive_child(&mut self, cached: CachedStartArgs) {
        tracing::info!(
            endpoint = %cached.endpoint_name,
            "user endpoint stopped within grace period; reviving"
        );
        let local_identity = match &self.identity_mapper {
            Some(mapper) => mapper.map_identity(&cached.command.globus_identity_set),
            None => Ok(self.own_identity.clone()),
        };
        let local_identity = match local_identity {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "unable to re-resolve local user; not reviving");
                return;
            }
        };
        if let Err(e) = self.cmd_start_endpoint(&cached.command, &local_identity) {
            tracing::error!(error = %e, "failed to revive user endpoint");
        }
    }

    fn send_heartbeat(&self, shutting_down: bool) {
        let period = if shutting_down {
            0
        } else {
            self.config.heartbeat_period_effective() as i64
        };
        let report = EpStatusReport::new(&self.endpoint_id, period);
        match report.pack() {
            Ok(bytes) => {
                if let Err(e) = self.result_publisher.publish(&self.heartbeat_routing_key, &bytes) {
                    tracing::warn!(error = %e, "failed to send heartbeat");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode heartbeat"),
        }
    }

    /// Sends a failure notice via a short-lived forked helper process, so
    /// the publish happens with fresh credentials and cannot deadlock the
    /// supervisor's own connection (`spec.md` §4.5/§7
    /// `send_failure_notice`). The helper is recorded in the child
    /// registry with no local user info so the ordinary reaper cleans it
    /// up uniformly (`spec.md` §3 `ChildRecord`).
    fn send_failure_notice(&mut self, command: Option<&CommandMessage>, reason: &str) {
        tracing::warn!(reason, "sending failure notice to control plane");
        let amqp_creds = command.and_then(|c| c.kwargs.get("amqp_creds"));
        let endpoint_name = command
            .and_then(|c| c.kwargs.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match failure_notice::spawn(amqp_creds, reason) {
            Ok(pid) => {
                self.registry.insert(ChildRecord {
                    pid,
                    local_user_info: None,
                    endpoint_name: endpoint_name.unwrap_or_else(|| pid.as_raw().to_string()),
                    started_at: Instant::now(),
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "unable to fork failure-notice helper");
            }
        }
    }

    /// Full shutdown sequence (`spec.md` §4.7): stop accepting new
    /// commands, send a final heartbeat with `heartbeat_period=0`, signal
    /// every child (as its own uid/gid) with `SIGTERM` then `SIGKILL`
    /// after a grace window, then reap.
    pub fn shutdown(&mut self) {
        if let Some(mapper) = self.identity_mapper.as_mut() {
            mapper.stop_watching();
        }
        self.send_heartbeat(true);

        let proc_uid = getuid();
        let proc_gid = getgid();

        for (signal, grace) in [(Signal::SIGTERM, Duration::from_secs(10)), (Signal::SIGKILL, Duration::ZERO)] {
            let targets: Vec<(Pid, Option<(u32, u32)>)> = self
                .registry
                .iter()
                .map(|r| (r.pid, r.local_user_info.as_ref().map(|id| (id.uid, id.gid))))
                .collect();
            for (pid, owner) in targets {
                let result = match owner {
                    Some((uid, gid)) => signal_child_as_owner(
                        pid,
                        Uid::from_raw(uid),
                        Gid::from_raw(gid),
                        signal,
                        proc_uid,
                        proc_gid,
                    ),
                    // The failure-notice helper never drops privileges, so
                    // it can be signaled directly under the manager's own
                    // uid/gid (`spec.md` §3 `ChildRecord`).
                    None => kill(pid, signal),
                };
                if let Err(e) = result {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "failed to signal child during shutdown");
                }
            }
            let deadline = Instant::now() + grace;
            while !self.registry.is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(500));
                self.wait_for_children();
            }
        }
    }
}

fn signal_child_as_owner(
    pid: Pid,
    uid: Uid,
    gid: Gid,
    signal: Signal,
    restore_uid: Uid,
    restore_gid: Gid,
) -> Result<(), nix::errno::Errno> {
    let result = (|| {
        setresgid(gid, gid, Gid::from_raw(u32::MAX))?;
        setresuid(uid, uid, Uid::from_raw(u32::MAX))?;
        let pgid = getpgid(Some(pid))?;
        kill(Pid::from_raw(-pgid.as_raw()), signal)
    })();
    setresuid(restore_uid, restore_uid, Uid::from_raw(u32::MAX)).ok();
    setresgid(restore_gid, restore_gid, Gid::from_raw(u32::MAX)).ok();
    result
}

/// `spec.md` §4.5 step 4: content-type gate before any JSON decode is even
/// attempted (§8: "no handler is invoked and a failure-notice fork is
/// spawned"). Kept as a pure function so the gate and decode failure paths
/// are testable without a live dispatch loop.
fn decode_command(properties: &crate::wire::MessageProperties, body: &[u8]) -> Result<CommandMessage, String> {
    if properties.content_type.as_deref() != Some("application/json") {
        return Err(format!(
            "invalid message type; expecting JSON, got {:?}",
            properties.content_type
        ));
    }
    serde_json::from_slice(body).map_err(|e| format!("unable to deserialize command: {e}"))
}

/// `^cmd_[A-Za-z][0-9A-Za-z_]{0,99}$`, hand-rolled rather than pulling in
/// `regex` for a single anchored-ASCII check.
fn is_valid_command_name(name: Option<&str>) -> bool {
    let Some(name) = name else { return false };
    let Some(rest) = name.strip_prefix("cmd_") else {
        return false;
    };
    if rest.is_empty() || rest.len() > VALID_COMMAND_PATTERN_MAX_LEN {
        return false;
    }
    let mut chars = rest.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_command_names_match_the_server_convention() {
        assert!(is_valid_command_name(Some("cmd_start_endpoint")));
        assert!(is_valid_command_name(Some("cmd_a")));
        assert!(!is_valid_command_name(Some("start_endpoint")));
        assert!(!is_valid_command_name(Some("cmd_")));
        assert!(!is_valid_command_name(Some("cmd_1abc")));
        assert!(!is_valid_command_name(None));
    }

    #[test]
    fn overlong_command_name_is_rejected() {
        let name = format!("cmd_{}", "a".repeat(200));
        assert!(!is_valid_command_name(Some(&name)));
    }

    fn json_properties() -> crate::wire::MessageProperties {
        crate::wire::MessageProperties {
            content_type: Some("application/json".into()),
            timestamp: None,
            headers: Default::default(),
        }
    }

    #[test]
    fn decode_command_rejects_non_json_content_type_before_parsing() {
        let properties = crate::wire::MessageProperties {
            content_type: Some("text/plain".into()),
            timestamp: None,
            headers: Default::default(),
        };
        let err = decode_command(&properties, b"not even json").unwrap_err();
        assert!(err.contains("invalid message type"));
    }

    #[test]
    fn decode_command_rejects_missing_content_type() {
        let properties = crate::wire::MessageProperties {
            content_type: None,
            timestamp: None,
            headers: Default::default(),
        };
        let err = decode_command(&properties, b"{}").unwrap_err();
        assert!(err.contains("invalid message type"));
    }

    #[test]
    fn decode_command_rejects_malformed_json_with_correct_content_type() {
        let err = decode_command(&json_properties(), b"{not json").unwrap_err();
        assert!(err.contains("unable to deserialize"));
    }

    #[test]
    fn decode_command_accepts_well_formed_json_command() {
        let body = serde_json::json!({
            "command": "cmd_start_endpoint",
            "args": [],
            "kwargs": {"name": "ep1"},
            "globus_effective_identity": "id",
            "globus_identity_set": [],
            "globus_username": "alice",
        })
        .to_string();
        let command = decode_command(&json_properties(), body.as_bytes()).unwrap();
        assert_eq!(command.command.as_deref(), Some("cmd_start_endpoint"));
    }
}
