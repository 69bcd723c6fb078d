//! Desktop notifications through an external command.

use std::process::{Command, Stdio};

use anyhow::{bail, Result};
use soundwatch_core::{DetectionEvent, EventNotifier};
use tracing::{debug, warn};

pub const NOTIFICATION_TITLE: &str = "Sound Detected";

/// Spawns a configured program for every detection, e.g.
/// `notify-send {title} {message}`. The child is reaped on a detached thread
/// so the classification loop never waits on it.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: &[String]) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("notify command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render_args(&self, event: &DetectionEvent) -> Vec<String> {
        let message = event.message();
        let score = format!("{:.3}", event.score);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{title}", NOTIFICATION_TITLE)
                    .replace("{message}", &message)
                    .replace("{label}", &event.label)
                    .replace("{score}", &score)
            })
            .collect()
    }
}

impl EventNotifier for CommandNotifier {
    fn notify(&self, event: &DetectionEvent) {
        let spawned = Command::new(&self.program)
            .args(self.render_args(event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                debug!(program = %self.program, pid = child.id(), seq = event.seq, "notify command spawned");
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to run notify command");
            }
        }
    }
}
