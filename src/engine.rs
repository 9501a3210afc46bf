use crate::config::EngineConfig;
use crate::process::{self, LaunchSpec, ProcessError};
use std::collections::HashMap;
use std::fmt;

/// What `kill_application` should look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationTarget {
    /// Reference id the engine was tagged with at launch.
    EngineRef(String),
    /// Free text from the engine's output that identifies the application.
    Clue(String),
}

impl fmt::Display for ApplicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationTarget::EngineRef(id) => write!(f, "engine ref {id}"),
            ApplicationTarget::Clue(clue) => write!(f, "clue {clue:?}"),
        }
    }
}

/// One engine flavor: how to name its logs and how to build its command line.
pub trait Engine: Send + Sync {
    /// Prefix of the log files, e.g. `spark` for `spark.log.0`.
    fn module(&self) -> &str;

    fn commands(&self) -> Result<Vec<String>, ProcessError>;

    fn env(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Variable that must locate the engine installation before launch.
    fn home_var(&self) -> Option<&str> {
        None
    }

    /// Ask the engine's resource manager to kill an application. Returns a
    /// human readable report; empty when the engine has no such facility.
    fn kill_application(&self, _target: &ApplicationTarget) -> String {
        String::new()
    }

    fn launch_spec(&self) -> Result<LaunchSpec, ProcessError> {
        Ok(LaunchSpec {
            commands: self.commands()?,
            env: self.env(),
            home_var: self.home_var().map(str::to_string),
        })
    }
}

/// An engine whose command line comes straight from configuration.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl Engine for CommandEngine {
    fn module(&self) -> &str {
        &self.config.module
    }

    fn commands(&self) -> Result<Vec<String>, ProcessError> {
        process::parse_command(&self.config.command)
    }

    fn env(&self) -> HashMap<String, String> {
        self.config.env.clone().unwrap_or_default()
    }

    fn home_var(&self) -> Option<&str> {
        self.config.home_var.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(command: &str) -> CommandEngine {
        CommandEngine::new(EngineConfig {
            module: "spark".to_string(),
            command: command.to_string(),
            home_var: Some("SPARK_HOME".to_string()),
            env: Some(HashMap::from([("SPARK_HOME".to_string(), "/opt/spark".to_string())])),
        })
    }

    #[test]
    fn test_launch_spec_from_config() {
        let spec = engine("bin/spark-submit --class Main app.jar").launch_spec().unwrap();
        assert_eq!(spec.commands, vec!["bin/spark-submit", "--class", "Main", "app.jar"]);
        assert_eq!(spec.env.get("SPARK_HOME").unwrap(), "/opt/spark");
        assert_eq!(spec.home_var.as_deref(), Some("SPARK_HOME"));
    }

    #[test]
    fn test_launch_spec_rejects_empty_command() {
        assert!(matches!(
            engine("").launch_spec().unwrap_err(),
            ProcessError::InvalidCommand(_)
        ));
    }

    #[test]
    fn test_default_kill_application_is_noop() {
        let e = engine("true");
        assert_eq!(e.kill_application(&ApplicationTarget::EngineRef("abc".into())), "");
        assert_eq!(e.kill_application(&ApplicationTarget::Clue("application_1".into())), "");
    }

    #[test]
    fn test_application_target_display() {
        assert_eq!(ApplicationTarget::EngineRef("r1".into()).to_string(), "engine ref r1");
        assert_eq!(ApplicationTarget::Clue("app".into()).to_string(), "clue \"app\"");
    }
}
