//! Copernicus Marine backend, driven through the `copernicusmarine` toolbox.
//!
//! The dataset identifier is the source URL. `describe` yields the time
//! coordinate; `subset` writes one time step of the selected variables as
//! netCDF. Credentials come from a `.env` file or the environment and reach
//! the toolbox through its environment, never its command line.

use super::dataset::DatasetBackend;
use super::provider::FetchError;
use crate::cf_time::{CfUnits, TimeAxis};
use crate::source::DataSource;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const USERNAME_VAR: &str = "COPERNICUSMARINE_SERVICE_USERNAME";
pub const PASSWORD_VAR: &str = "COPERNICUSMARINE_SERVICE_PASSWORD";

/// Units of the toolbox's time coordinate when it does not state them.
const DEFAULT_TIME_UNITS: &str = "milliseconds since 1970-01-01 00:00:00";

/// Guard against a describe response that would expand to an absurd axis.
const MAX_AXIS_LEN: f64 = 10_000_000.0;

const STAGING_DIR: &str = ".earthfetch-partial";

/// Options from `storage_options.cmems`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CmemsOptions {
    pub executable: String,
    /// `.env` file holding the credentials; `./.env` when unset.
    pub env_file: Option<PathBuf>,
    /// Appended to every `subset` call.
    pub extra_args: Vec<String>,
}

impl Default for CmemsOptions {
    fn default() -> Self {
        Self {
            executable: "copernicusmarine".into(),
            env_file: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// Read both variables from the environment, falling back to `env_file`
    /// or, when unset, a `.env` found from the working directory upwards.
    pub fn load(env_file: Option<&Path>) -> Result<Self, FetchError> {
        let from_file = match env_file {
            Some(path) => read_env_file(path)?,
            None => {
                if dotenv::dotenv().is_err() {
                    tracing::debug!("no .env file found, using process environment");
                }
                HashMap::new()
            }
        };
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| from_file.get(key).cloned())
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FetchError> {
        let get = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    FetchError::MissingCredentials(format!(
                        "{key} is not set; add it to a .env file in the project root"
                    ))
                })
        };
        Ok(Self {
            username: get(USERNAME_VAR)?,
            password: get(PASSWORD_VAR)?,
        })
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, FetchError> {
    let unreadable =
        |e: dotenv::Error| FetchError::MissingCredentials(format!("cannot read {}: {e}", path.display()));
    dotenv::from_path_iter(path)
        .map_err(unreadable)?
        .map(|item| item.map_err(unreadable))
        .collect()
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs. Replaced by fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, adding `env` to the inherited environment.
    fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput, FetchError>;
}

/// Runs commands with [`std::process::Command`].
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
    ) -> Result<CommandOutput, FetchError> {
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().copied())
            .output()
            .map_err(|e| {
                let message = if e.kind() == io::ErrorKind::NotFound {
                    format!("'{program}' not found; install the Copernicus Marine toolbox")
                } else {
                    format!("failed to run '{program}': {e}")
                };
                FetchError::Backend {
                    backend: "cmems",
                    message,
                }
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub struct CmemsBackend {
    dataset_id: String,
    options: CmemsOptions,
    runner: Box<dyn CommandRunner>,
    credentials: Option<Credentials>,
}

impl CmemsBackend {
    pub fn from_source(
        source: &DataSource,
        runner: Box<dyn CommandRunner>,
    ) -> Result<Self, FetchError> {
        let options = source
            .storage_options()?
            .protocol_options("cmems")
            .map_err(|e| source.invalid(format!("storage_options.cmems: {e}")))?;
        Ok(Self {
            dataset_id: source.url()?.trim().to_string(),
            options,
            runner,
            credentials: None,
        })
    }

    /// Use these credentials instead of reading the environment.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn credentials(&self) -> Result<Credentials, FetchError> {
        match &self.credentials {
            Some(c) => Ok(c.clone()),
            None => Credentials::load(self.options.env_file.as_deref()),
        }
    }

    fn run(&self, args: &[String], env: &[(&str, &str)]) -> Result<CommandOutput, FetchError> {
        tracing::debug!("running {} {}", self.options.executable, args.join(" "));

        let output = self.runner.run(&self.options.executable, args, env)?;
        if !output.success {
            return Err(FetchError::Backend {
                backend: "cmems",
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Arguments of the `subset` call writing `t` to `dir/file_name`.
    pub fn subset_args(
        &self,
        t: NaiveDateTime,
        variables: &[String],
        dir: &Path,
        file_name: &str,
    ) -> Vec<String> {
        let when = t.format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut args = vec![
            "subset".to_string(),
            "--dataset-id".into(),
            self.dataset_id.clone(),
        ];
        for var in variables {
            args.push("--variable".into());
            args.push(var.clone());
        }
        args.extend([
            "--start-datetime".into(),
            when.clone(),
            "--end-datetime".into(),
            when,
            "--output-directory".into(),
            dir.display().to_string(),
            "--output-filename".into(),
            file_name.to_string(),
        ]);
        args.extend(self.options.extra_args.iter().cloned());
        args
    }
}

impl DatasetBackend for CmemsBackend {
    fn name(&self) -> &'static str {
        "cmems"
    }

    fn open_time_axis(&self) -> Result<TimeAxis, FetchError> {
        let output = self.run(
            &[
                "describe".to_string(),
                "--dataset-id".into(),
                self.dataset_id.clone(),
            ],
            &[],
        )?;
        let json: Value =
            serde_json::from_str(&output.stdout).map_err(|e| FetchError::ResponseFormat {
                url: self.dataset_id.clone(),
                message: format!("describe output is not JSON: {e}"),
            })?;
        time_axis_from_describe(&json).map_err(|message| FetchError::ResponseFormat {
            url: self.dataset_id.clone(),
            message,
        })
    }

    fn describe(&self, t: NaiveDateTime, variables: &[String]) -> String {
        format!(
            "cmems://{}?variables={}&time={}",
            self.dataset_id,
            variables.join(","),
            t.format("%Y-%m-%dT%H:%M:%S")
        )
    }

    fn fetch_subset(
        &self,
        t: NaiveDateTime,
        variables: &[String],
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let credentials = self.credentials()?;
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let staging = parent.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| FetchError::io(&staging, e))?;

        // the toolbox may append an extension to unknown suffixes
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.strip_suffix(".part").unwrap_or(n))
            .ok_or_else(|| FetchError::InvalidRequest(format!("bad destination {}", dest.display())))?;
        let staged = staging.join(file_name);

        let args = self.subset_args(t, variables, &staging, file_name);
        let env = [
            (USERNAME_VAR, credentials.username.as_str()),
            (PASSWORD_VAR, credentials.password.as_str()),
        ];
        let result = self.run(&args, &env).and_then(|_| {
            if !staged.is_file() {
                return Err(FetchError::Backend {
                    backend: "cmems",
                    message: format!("subset did not produce {}", staged.display()),
                });
            }
            fs::rename(&staged, dest).map_err(|e| FetchError::io(dest, e))?;
            fs::metadata(dest)
                .map(|m| m.len())
                .map_err(|e| FetchError::io(dest, e))
        });
        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        let _ = fs::remove_dir(&staging);
        result
    }
}

/// Build the time axis from `copernicusmarine describe` JSON.
///
/// Uses the first `time` coordinate found: its explicit `values` when
/// present, otherwise the regular `minimum_value`..`maximum_value` by `step`.
pub fn time_axis_from_describe(json: &Value) -> Result<TimeAxis, String> {
    let coord = find_time_coordinate(json).ok_or("no time coordinate in describe output")?;
    let units = coord
        .get("coordinate_unit")
        .or_else(|| coord.get("units"))
        .and_then(Value::as_str)
        .filter(|u| u.contains(" since "))
        .unwrap_or(DEFAULT_TIME_UNITS);
    let units = CfUnits::parse(units).map_err(|e| e.to_string())?;

    let explicit: Vec<f64> = coord
        .get("values")
        .and_then(Value::as_array)
        .map(|vals| vals.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();

    let offsets = if !explicit.is_empty() {
        explicit
    } else {
        let number = |key: &str| {
            coord
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("time coordinate has no '{key}'"))
        };
        let (min, max, step) = (number("minimum_value")?, number("maximum_value")?, number("step")?);
        if step <= 0.0 || max < min {
            return Err(format!("invalid time range {min}..{max} step {step}"));
        }
        let steps = ((max - min) / step).round();
        if steps >= MAX_AXIS_LEN {
            return Err(format!("time range {min}..{max} step {step} is too long"));
        }
        (0..=steps as u64).map(|i| min + i as f64 * step).collect()
    };
    TimeAxis::from_offsets(&units, &offsets).map_err(|e| e.to_string())
}

fn find_time_coordinate(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => {
            let id = map
                .get("coordinate_id")
                .or_else(|| map.get("coordinates_id"))
                .and_then(Value::as_str);
            if id == Some("time") {
                return Some(map);
            }
            map.values().find_map(find_time_coordinate)
        }
        Value::Array(items) => items.iter().find_map(find_time_coordinate),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StorageOptions;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Call = (Vec<String>, Vec<(String, String)>);

    /// Records calls and answers `describe`; `subset` writes the output file.
    #[derive(Clone, Default)]
    struct FakeRunner {
        calls: Arc<Mutex<Vec<Call>>>,
        describe: String,
        fail_with: Option<String>,
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            _program: &str,
            args: &[String],
            env: &[(&str, &str)],
        ) -> Result<CommandOutput, FetchError> {
            let env = env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.calls.lock().unwrap().push((args.to_vec(), env));
            if let Some(stderr) = &self.fail_with {
                return Ok(CommandOutput {
                    success: false,
                    stderr: stderr.clone(),
                    ..Default::default()
                });
            }
            if args[0] == "subset" {
                let flag = |name: &str| {
                    let i = args.iter().position(|a| a == name).unwrap();
                    args[i + 1].clone()
                };
                let path = Path::new(&flag("--output-directory")).join(flag("--output-filename"));
                fs::write(path, b"CDF\x01").unwrap();
            }
            Ok(CommandOutput {
                success: true,
                stdout: self.describe.clone(),
                stderr: String::new(),
            })
        }
    }

    fn creds() -> Credentials {
        Credentials {
            username: "user".into(),
            password: "secret".into(),
        }
    }

    fn chl_source(cmems: Option<&str>) -> DataSource {
        let mut storage = StorageOptions {
            cache_storage: Some("./{t:%Y%m%d}.nc".into()),
            ..Default::default()
        };
        if let Some(yaml) = cmems {
            storage
                .protocols
                .insert("cmems".into(), serde_yaml::from_str(yaml).unwrap());
        }
        DataSource {
            name: "chl".into(),
            url: Some("cmems_obs_chl_P1D".into()),
            storage_options: Some(storage),
            ..Default::default()
        }
    }

    fn backend(runner: FakeRunner) -> CmemsBackend {
        CmemsBackend::from_source(&chl_source(None), Box::new(runner))
            .unwrap()
            .with_credentials(creds())
    }

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn credentials_from_lookup() {
        let found = Credentials::from_lookup(|k| Some(format!("{k}-value"))).unwrap();
        assert_eq!(found.username, format!("{USERNAME_VAR}-value"));
        assert!(!format!("{found:?}").contains(PASSWORD_VAR));

        let missing = Credentials::from_lookup(|k| (k == USERNAME_VAR).then(|| "u".to_string()));
        assert!(matches!(missing, Err(FetchError::MissingCredentials(m)) if m.contains(PASSWORD_VAR)));
    }

    #[test]
    fn describe_with_regular_range() {
        let json = json!({"products": [{"datasets": [{"versions": [{"parts": [{"services": [{
            "variables": [{"short_name": "CHL", "coordinates": [
                {"coordinate_id": "latitude", "minimum_value": -90.0},
                {"coordinate_id": "time", "coordinate_unit": "milliseconds since 1970-01-01 00:00:00Z",
                 "minimum_value": 1577836800000.0, "maximum_value": 1578009600000.0,
                 "step": 86400000.0, "values": null}
            ]}]
        }]}]}]}]}]});
        let axis = time_axis_from_describe(&json).unwrap();
        assert_eq!(axis.as_slice(), &[day(1), day(2), day(3)]);
    }

    #[test]
    fn describe_with_explicit_values() {
        let json = json!({"coordinates": [{"coordinate_id": "time", "coordinate_unit": "hours since 2020-01-01",
            "values": [0.0, 24.0, 96.0]}]});
        let axis = time_axis_from_describe(&json).unwrap();
        assert_eq!(axis.as_slice(), &[day(1), day(2), day(5)]);
        assert!(time_axis_from_describe(&json!({"products": []})).is_err());
    }

    #[test]
    fn subset_writes_through_staging() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::default();
        let calls = Arc::clone(&runner.calls);
        let backend = backend(runner);

        let dest = dir.path().join("chl_20200102.nc.part");
        let bytes = backend
            .fetch_subset(day(2), &["CHL".into()], &dest)
            .unwrap();
        assert_eq!(bytes, 4);
        assert!(dest.is_file());
        assert!(!dir.path().join(STAGING_DIR).exists());

        let calls = calls.lock().unwrap();
        let (args, _) = &calls[0];
        assert_eq!(&args[..3], &["subset", "--dataset-id", "cmems_obs_chl_P1D"]);
        assert!(args.windows(2).any(|w| w == ["--variable", "CHL"]));
        assert!(args.windows(2).any(|w| w == ["--start-datetime", "2020-01-02T00:00:00"]));
        assert!(args.windows(2).any(|w| w == ["--output-filename", "chl_20200102.nc"]));
    }

    #[test]
    fn credentials_travel_in_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::default();
        let calls = Arc::clone(&runner.calls);
        backend(runner)
            .fetch_subset(day(2), &["CHL".into()], &dir.path().join("a.nc"))
            .unwrap();

        let calls = calls.lock().unwrap();
        let (args, env) = &calls[0];
        assert!(!args.iter().any(|a| a.contains("secret") || a == "--password"));
        assert!(!args.iter().any(|a| a == "--username"));
        assert!(env.contains(&(PASSWORD_VAR.to_string(), "secret".to_string())));
        assert!(env.contains(&(USERNAME_VAR.to_string(), "user".to_string())));
    }

    #[test]
    fn credentials_from_configured_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("marine.env");
        fs::write(
            &env_file,
            format!("{USERNAME_VAR}=file-user\n{PASSWORD_VAR}=file-pass\n"),
        )
        .unwrap();
        let source = chl_source(Some(&format!("{{env_file: '{}'}}", env_file.display())));
        let runner = FakeRunner::default();
        let calls = Arc::clone(&runner.calls);
        let backend = CmemsBackend::from_source(&source, Box::new(runner)).unwrap();

        backend
            .fetch_subset(day(2), &["CHL".into()], &dir.path().join("b.nc"))
            .unwrap();
        let calls = calls.lock().unwrap();
        let env = &calls[0].1;
        // a value exported in the environment wins over the file
        let expected = std::env::var(PASSWORD_VAR).unwrap_or_else(|_| "file-pass".into());
        assert!(env.contains(&(PASSWORD_VAR.to_string(), expected)));
    }

    #[test]
    fn unreadable_env_file_is_a_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Credentials::load(Some(&dir.path().join("absent.env"))).unwrap_err();
        assert!(matches!(err, FetchError::MissingCredentials(m) if m.contains("absent.env")));
    }

    #[test]
    fn failed_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(FakeRunner {
            fail_with: Some("Invalid credentials\n".into()),
            ..Default::default()
        });
        let err = backend
            .fetch_subset(day(2), &["CHL".into()], &dir.path().join("x.nc.part"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Backend { message, .. } if message == "Invalid credentials"));
        assert!(backend.open_time_axis().is_err());
    }

    #[test]
    fn open_time_axis_parses_describe_stdout() {
        let backend = backend(FakeRunner {
            describe: json!({"coordinates": [{"coordinate_id": "time",
                "values": [1577836800000.0]}]})
            .to_string(),
            ..Default::default()
        });
        assert_eq!(backend.open_time_axis().unwrap().as_slice(), &[day(1)]);
    }
}
