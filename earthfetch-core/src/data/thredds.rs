//! THREDDS backend: OPeNDAP for the time axis, NetCDF Subset Service for data.
//!
//! The source URL is the dataset's OPeNDAP endpoint
//! (`.../thredds/dodsC/<path>`). Its DAS gives the units of the time
//! variable and its ASCII service the raw offsets. Subsets are requested from
//! the matching NCSS endpoint (`.../thredds/ncss/grid/<path>`), which returns
//! netCDF bytes directly.

use super::dataset::DatasetBackend;
use super::protocol::strip_thredds_prefix;
use super::provider::FetchError;
use super::transport::HttpTransport;
use crate::cf_time::{CfUnits, TimeAxis};
use crate::source::{ConfigError, DataSource};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use url::Url;

/// Options from `storage_options.thredds`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreddsOptions {
    pub time_variable: String,
    /// Full NCSS URL, when it cannot be derived from the OPeNDAP one.
    pub subset_path: Option<String>,
    /// NCSS output format.
    pub accept: String,
}

impl Default for ThreddsOptions {
    fn default() -> Self {
        Self {
            time_variable: "time".into(),
            subset_path: None,
            accept: "netcdf4".into(),
        }
    }
}

pub struct ThreddsBackend {
    opendap: String,
    subset: String,
    options: ThreddsOptions,
    transport: HttpTransport,
}

impl ThreddsBackend {
    pub fn from_source(source: &DataSource, transport: HttpTransport) -> Result<Self, FetchError> {
        let opendap = strip_thredds_prefix(source.url()?).to_string();
        let options: ThreddsOptions = source
            .storage_options()?
            .protocol_options("thredds")
            .map_err(|e| source.invalid(format!("storage_options.thredds: {e}")))?;
        Url::parse(&opendap).map_err(|e| source.invalid(format!("url '{opendap}': {e}")))?;

        let subset = match &options.subset_path {
            Some(path) => path.clone(),
            None if opendap.contains("/dodsC/") => opendap.replacen("/dodsC/", "/ncss/grid/", 1),
            None => {
                return Err(ConfigError::Invalid {
                    source_name: source.name.clone(),
                    message: format!(
                        "cannot derive a subset service from '{opendap}'; set storage_options.thredds.subset_path"
                    ),
                }
                .into())
            }
        };

        Ok(Self {
            opendap,
            subset,
            options,
            transport,
        })
    }

    /// NCSS request for one time step.
    pub fn subset_url(&self, t: NaiveDateTime, variables: &[String]) -> Result<String, FetchError> {
        let mut url = Url::parse(&self.subset)
            .map_err(|e| FetchError::InvalidRequest(format!("subset url '{}': {e}", self.subset)))?;
        {
            let mut query = url.query_pairs_mut();
            for var in variables {
                query.append_pair("var", var);
            }
            query
                .append_pair("time", &t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                .append_pair("accept", &self.options.accept);
        }
        Ok(url.into())
    }
}

impl DatasetBackend for ThreddsBackend {
    fn name(&self) -> &'static str {
        "thredds"
    }

    fn open_time_axis(&self) -> Result<TimeAxis, FetchError> {
        let var = &self.options.time_variable;

        let das_url = format!("{}.das", self.opendap);
        let das = self.transport.get_text(&das_url)?;
        let units = parse_das_units(&das, var).ok_or_else(|| FetchError::ResponseFormat {
            url: das_url.clone(),
            message: format!("no units attribute for variable '{var}'"),
        })?;
        let units = CfUnits::parse(&units)?;

        let ascii_url = format!("{}.ascii?{var}", self.opendap);
        let body = self.transport.get_text(&ascii_url)?;
        let values = parse_ascii_values(&body).map_err(|message| FetchError::ResponseFormat {
            url: ascii_url,
            message,
        })?;
        tracing::debug!(url = %self.opendap, steps = values.len(), "read time axis");
        Ok(TimeAxis::from_offsets(&units, &values)?)
    }

    fn describe(&self, t: NaiveDateTime, variables: &[String]) -> String {
        self.subset_url(t, variables)
            .unwrap_or_else(|e| e.to_string())
    }

    fn fetch_subset(
        &self,
        t: NaiveDateTime,
        variables: &[String],
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let url = self.subset_url(t, variables)?;
        tracing::debug!(%url, "requesting subset");
        self.transport.download_to(&url, dest)
    }
}

/// `units` attribute of `variable` in an OPeNDAP DAS document.
pub fn parse_das_units(das: &str, variable: &str) -> Option<String> {
    let block = Regex::new(&format!(r"(?m)^\s*{}\s*\{{([^}}]*)\}}", regex::escape(variable))).ok()?;
    let units = Regex::new(r#"(?m)^\s*String\s+units\s+"([^"]*)""#).ok()?;
    let body = block.captures(das)?.get(1)?.as_str();
    units.captures(body).map(|c| c[1].to_string())
}

/// Numbers of a one-dimensional OPeNDAP ASCII response.
pub fn parse_ascii_values(body: &str) -> Result<Vec<f64>, String> {
    let data = body
        .split_once("\n---")
        .map(|(_, rest)| rest.split_once('\n').map_or("", |(_, data)| data))
        .unwrap_or(body);

    let mut values = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains('[') {
            continue;
        }
        for (i, token) in line.split(',').map(str::trim).enumerate() {
            match token.parse::<f64>() {
                Ok(v) => values.push(v),
                // older servers prefix each row with the variable name
                Err(_) if i == 0 => continue,
                Err(_) => return Err(format!("unexpected value '{token}'")),
            }
        }
    }
    if values.is_empty() {
        return Err("response holds no values".into());
    }
    Ok(values)
}
