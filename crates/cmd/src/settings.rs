// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use blockdelta_common_telemetry::logging::LoggingOptions;
use blockdelta_downloader::DownloaderConfig;
use config::{ConfigError, Environment, File, Source};
use serde::{Deserialize, Serialize};

/// Environment prefix, e.g. `BLOCKDELTA__DOWNLOADER__MAX_REDIRECTS=3`.
const ENV_PREFIX: &str = "BLOCKDELTA";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging:    LoggingOptions,
    pub downloader: DownloaderConfig,
}

impl Settings {
    /// Defaults, then the optional config file, then `BLOCKDELTA_*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if File::with_name(path).collect().is_err() {
                return Err(ConfigError::Message(format!(
                    "Config file {path} does not exist"
                )));
            }
            builder = builder.add_source(File::with_name(path));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use blockdelta_common_telemetry::logging::LogFormat;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.downloader, DownloaderConfig::default());
        assert!(settings.logging.append_stdout);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Settings::load(Some("/nonexistent/blockdelta.toml")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[logging]
log_format = "json"

[downloader]
max_redirects = 3

[downloader.multi_range]
max_ranges_per_request = 50
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let settings = Settings::load(Some(path)).unwrap();
        assert_eq!(settings.logging.log_format, LogFormat::Json);
        assert_eq!(settings.downloader.max_redirects, 3);
        assert_eq!(settings.downloader.multi_range.max_ranges_per_request, 50);
        assert!(settings.downloader.multi_range.enabled);
    }
}
