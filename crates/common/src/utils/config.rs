use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Layered load: `defaults`, then the optional file, then `{PREFIX}_*`
/// environment variables (`__` separates nested keys, e.g.
/// `FAUCET_DB__PATH`).
pub fn load_layered<T, P>(defaults: &T, path: Option<P>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    P: AsRef<Path>,
{
    let base = Config::try_from(defaults).context("Failed to serialize default configuration")?;
    let mut builder = Config::builder().add_source(base);

    if let Some(path) = path {
        let path_str = path.as_ref().to_str().context("Invalid config path")?;
        builder = builder.add_source(File::with_name(path_str));
    }

    let settings = builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_origins"),
        )
        .build()
        .context("Failed to build configuration")?;

    settings.try_deserialize::<T>().context("Failed to deserialize configuration")
}
