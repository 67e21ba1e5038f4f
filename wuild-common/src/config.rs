// Copyright 2024-2025 Wuild Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Layered configuration loading: compiled-in defaults, then an optional
/// TOML file, then `WUILD__`-prefixed environment overrides
/// (`WUILD__COORDINATOR__HOST=...`).
pub struct ConfigLoader<T: Debug + Default + Serialize + DeserializeOwned> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
    phantom: PhantomData<T>,
}

impl<T: Debug + Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
            phantom: PhantomData,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("WUILD__").split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    pub fn default_config_toml(&self) -> String {
        toml::to_string(&T::default()).unwrap_or_default()
    }

    /// Binary entry point helper: `--dump-config` and
    /// `--dump-config-examples` print TOML and return `None`; otherwise the
    /// merged config is loaded, with load failures reported on stderr.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let mut args = std::env::args();
        if args.any(|arg| arg == "--dump-config") {
            println!("{}", self.default_config_toml());
            return None;
        }
        if std::env::args().any(|arg| arg == "--dump-config-examples") {
            if let Some(make_examples) = self.make_examples {
                for (name, example) in make_examples() {
                    println!("# {name}");
                    println!("{}", toml::to_string(&example).unwrap_or_default());
                }
            }
            return None;
        }
        match self.load() {
            Ok(config) => Some(config),
            Err(err) => {
                eprintln!(
                    "failed to load config from {}: {err}",
                    self.config_file_name.display()
                );
                None
            }
        }
    }
}
