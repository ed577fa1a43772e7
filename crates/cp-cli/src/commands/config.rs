//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use cp_core::config::{self, ConfigFile};

fn resolve(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path)
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| "Failed to parse config file")
}

/// Print the config file location
pub fn config_path(config_path: Option<&Path>) -> Result<()> {
    println!("{}", resolve(config_path).display());
    Ok(())
}

/// Get a config value by dotted key
pub fn config_get(config_path: Option<&Path>, key: &str) -> Result<()> {
    let path = resolve(config_path);

    // Keys missing from the file still have a default
    let root = if path.exists() {
        toml::Value::Table(read_table(&path)?)
    } else {
        toml::Value::try_from(ConfigFile::default())?
    };

    let mut current = &root;
    for part in key.split('.') {
        match current {
            toml::Value::Table(t) => match t.get(part) {
                Some(v) => current = v,
                None => anyhow::bail!("Key not found: {}", key),
            },
            _ => anyhow::bail!("Key not found: {}", key),
        }
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Integer(i) => println!("{}", i),
        toml::Value::Float(f) => println!("{}", f),
        toml::Value::Boolean(b) => println!("{}", b),
        toml::Value::Array(a) => {
            for item in a {
                println!("{}", item);
            }
        }
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(current)?),
        toml::Value::Datetime(d) => println!("{}", d),
    }

    Ok(())
}

/// Set a config value by dotted key
///
/// The result must still load as a valid configuration, otherwise nothing is
/// written.
pub fn config_set(config_path: Option<&Path>, key: &str, value: &str) -> Result<()> {
    let path = resolve(config_path);

    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(config_path, false)?;
    }

    let mut table = read_table(&path)?;

    let parts: Vec<&str> = key.split('.').collect();
    let (last_key, parents) = match parts.split_last() {
        Some((last, parents)) if !last.is_empty() => (*last, parents),
        _ => anyhow::bail!("Invalid key: {:?}", key),
    };

    let mut current = &mut table;
    for part in parents {
        if !current.contains_key(*part) {
            current.insert(part.to_string(), toml::Value::Table(toml::Table::new()));
        }
        current = current
            .get_mut(*part)
            .and_then(|v| v.as_table_mut())
            .ok_or_else(|| anyhow::anyhow!("Cannot navigate to key: {}", key))?;
    }

    let toml_value = if value == "true" {
        toml::Value::Boolean(true)
    } else if value == "false" {
        toml::Value::Boolean(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    };
    current.insert(last_key.to_string(), toml_value);

    let new_content = toml::to_string_pretty(&table)?;
    toml::from_str::<ConfigFile>(&new_content)
        .with_context(|| format!("Refusing to set {}: result is not a valid configuration", key))?;

    std::fs::write(&path, new_content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Show the config file, or the defaults when there is none
pub fn config_show(config_path: Option<&Path>) -> Result<()> {
    let path = resolve(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'cocalc-plus config init' to create one. Defaults:");
        println!();
        println!("{}", toml::to_string_pretty(&ConfigFile::default())?);
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Write the default configuration
pub fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config_file = resolve(config_path);

    if config_file.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", config_file));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    config::save_config(&config_file, &ConfigFile::default())
        .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

    print_success(&format!("Created configuration file: {:?}", config_file));
    Ok(())
}
