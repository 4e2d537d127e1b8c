// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for isotest runs.
//!
//! Configuration is layered: the default config embedded in this crate comes first, and a
//! repository config file (`.config/isotest.toml` by default) is layered on top. Settings are
//! grouped into named profiles, each of which falls back to `[profile.default]`.

use crate::{
    ambient::NeutralSettings,
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
};
use camino::Utf8Path;
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use itertools::Itertools;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Overall configuration for isotest.
///
/// This is the root data structure for isotest configuration. Most runs use a single profile,
/// obtained through [`profile`](Self::profile).
#[derive(Clone, Debug)]
pub struct IsotestConfig {
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
}

impl IsotestConfig {
    /// The default location of the config within the workspace: `.config/isotest.toml`.
    pub const CONFIG_PATH: &'static str = ".config/isotest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/isotest.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have `.config/isotest.toml`, uses
    /// the default config options.
    pub fn from_sources(
        workspace_root: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (deserialized, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(config_file.clone(), kind))?;
        if !unknown.is_empty() {
            warn!(
                "in config file {}, ignoring unknown configuration keys: {}",
                config_file,
                unknown.iter().join(", "),
            );
        }

        Ok(deserialized.into_config())
    }

    /// Returns the config made of the embedded defaults alone.
    pub fn from_embedded() -> Self {
        let (deserialized, unknown) = Self::build_and_deserialize_config(
            &Self::make_default_config(),
        )
        .expect("default config is always valid");
        debug_assert!(
            unknown.is_empty(),
            "found unknown keys in default config: {}",
            unknown.iter().join(", ")
        );
        deserialized.into_config()
    }

    /// Returns the profile with the given name, or an error if it isn't known.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<IsotestProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = match name {
            Self::DEFAULT_PROFILE => None,
            other => Some(self.other_profiles.get(other).ok_or_else(|| {
                ProfileNotFound::new(
                    other,
                    self.other_profiles
                        .keys()
                        .map(String::as_str)
                        .chain(std::iter::once(Self::DEFAULT_PROFILE)),
                )
            })?),
        };
        Ok(IsotestProfile {
            name: name.to_owned(),
            default_profile: &self.default_profile,
            custom_profile,
        })
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(IsotestConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let config: IsotestConfigDeserialize =
            serde_ignored::deserialize(config, |path: serde_ignored::Path| {
                ignored.insert(path.to_string());
            })
            .map_err(|error| ConfigParseErrorKind::DeserializeError(Box::new(error)))?;

        Ok((config, ignored))
    }
}

/// A configuration profile, with every setting resolved against `[profile.default]`.
///
/// Returned by [`IsotestConfig::profile`].
#[derive(Clone, Debug)]
pub struct IsotestProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl IsotestProfile<'_> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the locale applied to isolated workers.
    pub fn neutral_locale(&self) -> &str {
        self.custom_profile
            .and_then(|profile| profile.neutral_locale.as_deref())
            .unwrap_or(&self.default_profile.neutral_locale)
    }

    /// Returns the neutral baseline every case starts from.
    pub fn neutral_settings(&self) -> NeutralSettings {
        NeutralSettings::with_locale(self.neutral_locale())
    }

    /// Returns true if class construction events are reported.
    pub fn report_class_construction(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.report_class_construction)
            .unwrap_or(self.default_profile.report_class_construction)
    }

    /// Returns true if the stderr of a worker that died without an outcome is reported.
    pub fn forward_worker_stderr(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.forward_worker_stderr)
            .unwrap_or(self.default_profile.forward_worker_stderr)
    }

    /// Returns the extra environment for isolated workers.
    ///
    /// Variables set by the profile are merged over those set by `[profile.default]`.
    pub fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = self.default_profile.worker_env.clone();
        if let Some(custom) = self.custom_profile.and_then(|p| p.worker_env.as_ref()) {
            env.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct IsotestConfigDeserialize {
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl IsotestConfigDeserialize {
    fn into_config(mut self) -> IsotestConfig {
        let p = self
            .profiles
            .remove(IsotestConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        IsotestConfig {
            default_profile: DefaultProfileImpl::new(p),
            other_profiles: self.profiles,
        }
    }
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    neutral_locale: String,
    report_class_construction: bool,
    forward_worker_stderr: bool,
    worker_env: BTreeMap<String, String>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            neutral_locale: p
                .neutral_locale
                .expect("profile.default.neutral-locale should be present"),
            report_class_construction: p
                .report_class_construction
                .expect("profile.default.report-class-construction should be present"),
            forward_worker_stderr: p
                .forward_worker_stderr
                .expect("profile.default.forward-worker-stderr should be present"),
            worker_env: p.worker_env.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    neutral_locale: Option<String>,
    #[serde(default)]
    report_class_construction: Option<bool>,
    #[serde(default)]
    forward_worker_stderr: Option<bool>,
    #[serde(default)]
    worker_env: Option<BTreeMap<String, String>>,
}
