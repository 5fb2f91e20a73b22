//! The failure-notice path (`spec.md` §4.5/§7): a short-lived forked
//! helper that tells the control plane a `cmd_start_endpoint` request
//! failed, using the AMQP credentials embedded in the command itself.
//!
//! Grounded on `endpoint_manager.py::send_failure_notice`: fork, and in
//! the child open a fresh connection with the supplied `amqp_creds`
//! (never the manager's own publisher — that `Future` handle is not valid
//! across fork, per `spec.md` §9) and publish, then `_exit(0)`
//! unconditionally so a broken notice never wedges reaping.

use nix::unistd::{fork, ForkResult, Pid};
use serde_json::Value;

use crate::registration::QueueInfo;

/// Forks a helper process that publishes `message` to the requester's own
/// result queue, described by `amqp_creds` (shaped like
/// [`QueueInfo`](crate::registration::QueueInfo), matching the structure
/// the control plane sends for a `cmd_start_endpoint` command). Returns
/// the helper's pid so the caller can register it in the child registry
/// and let the ordinary reaper clean it up.
pub fn spawn(amqp_creds: Option<&Value>, message: &str) -> Result<Pid, nix::errno::Errno> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            run_child(amqp_creds, message);
            std::process::exit(0);
        }
    }
}

fn run_child(amqp_creds: Option<&Value>, message: &str) {
    let Some(creds) = amqp_creds else {
        eprintln!("no amqp credentials supplied with this command; cannot notify requester: {message}");
        return;
    };
    let creds: QueueInfo = match serde_json::from_value(creds.clone()) {
        Ok(creds) => creds,
        Err(e) => {
            eprintln!("malformed amqp credentials; cannot notify requester: {e}");
            return;
        }
    };
    if let Err(e) = publish_failure(&creds, message) {
        eprintln!("unable to send user endpoint startup failure notice: {e}");
    }
}

/// Synchronous, from-scratch publish: builds its own single-threaded
/// runtime and connection rather than reusing anything the parent set up
/// before `fork`, since none of that is safe to touch post-fork.
fn publish_failure(creds: &QueueInfo, message: &str) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    runtime.block_on(async {
        let connection = lapin::Connection::connect(
            &creds.connection_url,
            lapin::ConnectionProperties::default(),
        )
        .await
        .map_err(|e| e.to_string())?;
        let channel = connection.create_channel().await.map_err(|e| e.to_string())?;
        let payload = serde_json::json!({ "error": message }).to_string();
        let confirm = channel
            .basic_publish(
                "",
                &creds.queue,
                lapin::options::BasicPublishOptions::default(),
                payload.as_bytes(),
                lapin::BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| e.to_string())?;
        confirm.await.map_err(|e| e.to_string())?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_amqp_creds_is_handled_without_panicking() {
        run_child(None, "no creds available");
    }

    #[test]
    fn malformed_amqp_creds_is_handled_without_panicking() {
        let bogus = serde_json::json!({"not": "a queue info"});
        run_child(Some(&bogus), "malformed creds");
    }
}
