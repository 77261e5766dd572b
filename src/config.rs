use crate::error::SubstrateError;

const THRESHOLD_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_THRESHOLD";
const METHOD_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_METHOD";
const CONTINUE_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_CONTINUE_DESPITE_FAILURE";
const REPORT_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_CREATE_REPORT";
const FILTER_FILE_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_CREATE_FILTER_FILE";

const DEFAULT_THRESHOLD: u64 = 100_000;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Policy {
    Absolute,
    Relative,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub threshold: u64,
    pub policy: Policy,
    pub continue_despite_failure: bool,
    pub create_report: bool,
    pub create_filter_file: bool,
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_flag(var: &str) -> bool {
    std::env::var(var).map(|v| is_truthy(&v)).unwrap_or(false)
}

impl Config {
    /// Parses the process environment once, at substrate init. A parse
    /// failure or a zero threshold is a fatal configuration error (§7):
    /// the caller is expected to abort startup rather than run with a
    /// guessed default.
    pub fn from_env() -> Result<Config, SubstrateError> {
        let threshold = match std::env::var(THRESHOLD_VAR) {
            Err(_) => DEFAULT_THRESHOLD,
            Ok(value) => {
                let parsed: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| SubstrateError::ConfigParse { var: THRESHOLD_VAR, value: value.clone() })?;
                if parsed == 0 {
                    return Err(SubstrateError::ZeroThreshold);
                }
                parsed
            }
        };

        let policy = match std::env::var(METHOD_VAR) {
            Err(_) => Policy::Absolute,
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "absolute" => Policy::Absolute,
                "relative" => Policy::Relative,
                _ => {
                    return Err(SubstrateError::ConfigParse { var: METHOD_VAR, value });
                }
            },
        };

        Ok(Config {
            threshold,
            policy,
            continue_despite_failure: env_flag(CONTINUE_VAR),
            create_report: env_flag(REPORT_VAR),
            create_filter_file: env_flag(FILTER_FILE_VAR),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each
    // other: std::env::set_var mutates global process state.
    lazy_static! {
        static ref ENV_LOCK: Mutex<()> = Mutex::new(());
    }

    fn clear_env() {
        for var in &[THRESHOLD_VAR, METHOD_VAR, CONTINUE_VAR, REPORT_VAR, FILTER_FILE_VAR] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.threshold, DEFAULT_THRESHOLD);
        assert_eq!(cfg.policy, Policy::Absolute);
        assert!(!cfg.continue_despite_failure);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(THRESHOLD_VAR, "0");
        assert!(matches!(Config::from_env(), Err(SubstrateError::ZeroThreshold)));
        clear_env();
    }

    #[test]
    fn unparseable_threshold_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(THRESHOLD_VAR, "not-a-number");
        assert!(matches!(Config::from_env(), Err(SubstrateError::ConfigParse { .. })));
        clear_env();
    }

    #[test]
    fn relative_policy_is_recognized() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(METHOD_VAR, "relative");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.policy, Policy::Relative);
        clear_env();
    }

    #[test]
    fn truthy_flags_are_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var(REPORT_VAR, "yes");
        std::env::set_var(FILTER_FILE_VAR, "1");
        let cfg = Config::from_env().unwrap();
        assert!(cfg.create_report);
        assert!(cfg.create_filter_file);
        clear_env();
    }
}
