//! Command-line flags. These override the settings file and environment.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use crate::settings::AppSettings;

pub const USAGE: &str = "\
Usage: soundwatch [options]

  --model <file.onnx>      classification model (overrides SOUNDWATCH_MODEL_PATH)
  --labels <file.json>     label table for the model
  --input <file.wav>       classify a WAV clip instead of the microphone
  --device <name>          preferred input device
  --stub-threshold <T>     use the threshold stub instead of a model
  --pipelined              classify on a second thread
  --notify-command <cmd>   desktop command run per detection, e.g.
                           \"notify-send {title} {message}\". Split on
                           whitespace, so no argument may contain a space;
                           use the placeholders, or set `notifyCommand` (an
                           argv array) in the settings file instead
  --settings <file.json>   settings file (default: app data directory)
  --save-settings          write the effective settings back and exit
  --list-devices           print input devices and exit
  -h, --help               show this help";

#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    Run(CliArgs),
    ListDevices,
    Help,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub settings_path: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub labels: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub device: Option<String>,
    pub stub_threshold: Option<f32>,
    pub pipelined: bool,
    pub notify_command: Option<Vec<String>>,
    pub save_settings: bool,
}

impl CliArgs {
    pub fn apply(&self, settings: &mut AppSettings) {
        if let Some(model) = &self.model {
            settings.model_path = Some(model.clone());
        }
        if let Some(labels) = &self.labels {
            settings.labels_path = Some(labels.clone());
        }
        if let Some(device) = &self.device {
            settings.preferred_input_device = Some(device.clone());
        }
        if let Some(threshold) = self.stub_threshold {
            settings.stub_threshold = threshold;
        }
        if self.pipelined {
            settings.pipeline_mode = "pipelined".into();
        }
        if let Some(command) = &self.notify_command {
            settings.notify_command = command.clone();
        }
        settings.normalize();
    }
}

pub fn parse_args<I>(args: I) -> Result<CliAction>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().ok_or_else(|| anyhow!("missing value for {flag}"));
        match arg.as_str() {
            "--model" => parsed.model = Some(PathBuf::from(value("--model")?)),
            "--labels" => parsed.labels = Some(PathBuf::from(value("--labels")?)),
            "--input" => parsed.input = Some(PathBuf::from(value("--input")?)),
            "--device" => parsed.device = Some(value("--device")?),
            "--settings" => parsed.settings_path = Some(PathBuf::from(value("--settings")?)),
            "--stub-threshold" => {
                let raw = value("--stub-threshold")?;
                let threshold = raw
                    .parse::<f32>()
                    .with_context(|| format!("invalid value for --stub-threshold: {raw}"))?;
                if !threshold.is_finite() {
                    bail!("invalid value for --stub-threshold: {raw}");
                }
                parsed.stub_threshold = Some(threshold);
            }
            // Whitespace-split; argv entries with spaces go in `notifyCommand`.
            "--notify-command" => {
                let raw = value("--notify-command")?;
                let command: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
                if command.is_empty() {
                    bail!("--notify-command needs a program");
                }
                parsed.notify_command = Some(command);
            }
            "--pipelined" => parsed.pipelined = true,
            "--save-settings" => parsed.save_settings = true,
            "--list-devices" => return Ok(CliAction::ListDevices),
            "--help" | "-h" => return Ok(CliAction::Help),
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(CliAction::Run(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliAction> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    fn run_args(args: &[&str]) -> CliArgs {
        match parse(args).expect("parse") {
            CliAction::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn no_flags_runs_with_defaults() {
        assert_eq!(run_args(&[]), CliArgs::default());
    }

    #[test]
    fn parses_every_valued_flag() {
        let args = run_args(&[
            "--model",
            "siren.onnx",
            "--labels",
            "labels.json",
            "--input",
            "street.wav",
            "--device",
            "USB Mic",
            "--stub-threshold",
            "42.5",
            "--pipelined",
            "--notify-command",
            "notify-send {title} {message}",
        ]);
        assert_eq!(args.model, Some(PathBuf::from("siren.onnx")));
        assert_eq!(args.labels, Some(PathBuf::from("labels.json")));
        assert_eq!(args.input, Some(PathBuf::from("street.wav")));
        assert_eq!(args.device.as_deref(), Some("USB Mic"));
        assert_eq!(args.stub_threshold, Some(42.5));
        assert!(args.pipelined);
        assert_eq!(
            args.notify_command,
            Some(vec![
                "notify-send".to_string(),
                "{title}".to_string(),
                "{message}".to_string()
            ])
        );
    }

    #[test]
    fn notify_command_splits_on_whitespace_only() {
        let args = run_args(&["--notify-command", "notify-send  \"Sound Detected\" {message}"]);
        assert_eq!(
            args.notify_command,
            Some(vec![
                "notify-send".to_string(),
                "\"Sound".to_string(),
                "Detected\"".to_string(),
                "{message}".to_string()
            ])
        );
        assert!(USAGE.contains("notifyCommand"));
    }

    #[test]
    fn list_devices_and_help_short_circuit() {
        assert_eq!(parse(&["--list-devices", "--bogus"]).expect("parse"), CliAction::ListDevices);
        assert_eq!(parse(&["-h"]).expect("parse"), CliAction::Help);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--model"]).is_err());
        assert!(parse(&["--stub-threshold", "loud"]).is_err());
        assert!(parse(&["--stub-threshold", "NaN"]).is_err());
        assert!(parse(&["--notify-command", "  "]).is_err());
        assert!(parse(&["--verbose"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let mut settings = AppSettings {
            model_path: Some(PathBuf::from("/file/model.onnx")),
            ..AppSettings::default()
        };
        run_args(&["--model", "cli.onnx", "--pipelined", "--device", "Line In"])
            .apply(&mut settings);
        assert_eq!(settings.model_path, Some(PathBuf::from("cli.onnx")));
        assert_eq!(settings.pipeline_mode, "pipelined");
        assert_eq!(settings.preferred_input_device.as_deref(), Some("Line In"));
    }
}
