use std::path::{Path, PathBuf};
use tracing::{info_span, info, debug};
use std::env;
use std::borrow::Cow;
use regex::{Regex, Captures};

use crate::sluicedb::{Error, Result};
use crate::sluicedb::config::config::Settings;


/// Load configuration settings from sluicedb.yaml
/// Searching in order:
/// 1) config_path passed as first command line argument
/// 2) Current directory
/// 3) Any parent directory of the current directory, up to root
/// 4) ~/.config/sluicedb/
/// 5) ~/
/// 6) /etc/sluicedb/
///
/// This replaces ${ENV_VAR[:DEFAULT]} parameters in the yaml file with values from the environment
/// variable, if set, otherwise, optionally with the given default value after the :
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    let settings = parse_config(&raw_yaml, config_path)?;
    Ok(Box::leak(Box::new(settings)))
}

/// Parse and validate settings from yaml text, substituting environment variables.
pub fn parse_config(raw_yaml: &str, config_path: PathBuf) -> Result<Settings> {
    let yaml_text = replace_env_vars(raw_yaml)?;
    let mut settings: Settings = serde_yaml::from_str(&yaml_text)?;
    settings.load(config_path)?;
    Ok(settings)
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Use the full path given as the first command line argument
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            if let Some(parent) = dir.parent() {
                dir = parent;
            } else {
                break;
            }
        }
    }

    // Check  ~/.config/sluicedb/{config_name}
    let mut conf_path = Path::join(Path::new(".config/sluicedb"), config_name);
    // HOME is required to be set on POSIX systems, but if it's not set we'll try ~/
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());
    conf_path = Path::join(Path::new(&home), conf_path);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check ~/.{config_name}
    conf_path = Path::join(Path::new(&home), ".".to_string() + config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check /etc/sluicedb/{config_name}
    conf_path = Path::join(Path::new("/etc/sluicedb"), config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}

fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    // We only call this function once and then never again, so don't keep the regex
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]+?))?\}").map_err(Error::new)?;

    let mut errors = Vec::<String>::new();

    let replaced_text = re_var.replace_all(raw_yaml, |caps: &Captures| {
        match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = caps.get(2) {
                    let s = default.as_str();
                    if let Some(msg) = s.strip_prefix('?') {
                        errors.push(msg.to_string());
                        String::new()
                    } else {
                        s.to_string()
                    }
                } else {
                    errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                    String::new()
                }
            }
        }
    });

    if errors.is_empty() {
        Ok(replaced_text)
    } else {
        Err(Error::new(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sluicedb::config::{SelectionCriteria, MasterFailureMode};

    const YAML: &str = r#"
port: 4100
num_workers: 2
proxy_protocol_networks: ["10.0.0.0/8", "192.168.1.1"]
service:
  user: maxuser
  password: ${SLUICEDB_TEST_UNSET_PASSWORD:secret}
  servers:
    - name: db1
      address: 10.0.0.1
    - name: db2
      address: 10.0.0.2
      rank: 2
  router:
    slave_selection_criteria: least_behind_master
    master_failure_mode: error_on_write
"#;

    #[test]
    fn test_parse_config_with_defaults() {
        let settings = parse_config(YAML, PathBuf::from("sluicedb.yaml")).expect("valid config");
        assert_eq!(settings.port, 4100);
        assert_eq!(settings.num_workers, 2);
        assert_eq!(settings.proxy_networks.len(), 2);
        let svc = &settings.service;
        assert_eq!(svc.password, "secret");
        assert_eq!(svc.servers[0].port, 3306);
        assert_eq!(svc.servers[0].rank, 1);
        assert_eq!(svc.servers[1].rank, 2);
        assert_eq!(svc.targets, vec!["db1".to_string(), "db2".to_string()]);
        assert_eq!(svc.router.slave_selection_criteria, SelectionCriteria::LeastBehindMaster);
        assert_eq!(svc.router.master_failure_mode, MasterFailureMode::ErrorOnWrite);
        assert_eq!(svc.router.max_sescmd_history, 50);
        assert_eq!(svc.users.users_refresh_time, 30);
    }

    #[test]
    fn test_required_env_var() {
        let err = replace_env_vars("password: ${SLUICEDB_TEST_UNSET_VAR}").unwrap_err();
        assert_eq!(err.to_string(), "environment variable SLUICEDB_TEST_UNSET_VAR is required but not defined");
        let err = replace_env_vars("password: ${SLUICEDB_TEST_UNSET_VAR:?password must be set}").unwrap_err();
        assert_eq!(err.to_string(), "password must be set");
    }

    #[test]
    fn test_invalid_proxy_network() {
        let yaml = YAML.replace("10.0.0.0/8", "10.0.0.0/40");
        assert!(parse_config(&yaml, PathBuf::new()).is_err());
    }
}
