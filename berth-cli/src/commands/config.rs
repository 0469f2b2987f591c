//! Config inspection and management commands.

use clap::{Args, Subcommand};
use serde_json::{json, Value};

use berth::catalog::Catalog;
use berth::config::ConfigFile;
use berth::writer::CatalogWriter;

use crate::error::CliError;
use crate::utils::{emit, GlobalOptions};

/// Inspect and manage configuration.
#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective service-type catalog
    Show,
    /// Validate the user config file
    Validate,
    /// Write a starter config.json
    Generate {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// List registered instances (alias of `berth instances`)
    Instances,
    /// Manage auto-allocation
    AutoAllocation {
        #[command(subcommand)]
        action: AutoAllocationAction,
    },
}

#[derive(Subcommand)]
enum AutoAllocationAction {
    /// Show auto-allocation settings
    Status,
    /// Enable auto-allocation (takes effect on daemon restart)
    Enable,
    /// Disable auto-allocation (takes effect on daemon restart)
    Disable,
    /// Remove an auto-allocated service type
    Undo {
        /// The service type to remove
        #[arg(value_name = "TYPE")]
        service_type: String,
    },
    /// List auto-allocated service types
    List,
}

impl ConfigCommand {
    /// Execute the command.
    pub fn execute(&self, global: &GlobalOptions) -> Result<(), CliError> {
        match &self.action {
            ConfigAction::Show => show(global),
            ConfigAction::Validate => validate(global),
            ConfigAction::Generate { force } => generate(global, *force),
            ConfigAction::Instances => crate::commands::InstancesCommand {}.execute(global),
            ConfigAction::AutoAllocation { action } => match action {
                AutoAllocationAction::Status => auto_status(global),
                AutoAllocationAction::Enable => auto_set_enabled(global, true),
                AutoAllocationAction::Disable => auto_set_enabled(global, false),
                AutoAllocationAction::Undo { service_type } => auto_undo(global, service_type),
                AutoAllocationAction::List => auto_list(global),
            },
        }
    }
}

fn load_catalog(global: &GlobalOptions) -> Result<(berth::Settings, Catalog), CliError> {
    let settings = global.settings()?;
    let catalog = Catalog::from_config(&settings.config_file)
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok((settings, catalog))
}

fn show(global: &GlobalOptions) -> Result<(), CliError> {
    let (_, catalog) = load_catalog(global)?;

    let mut lines = Vec::new();
    for service_type in catalog.iter() {
        let preferred: Vec<String> = service_type
            .preferred_ports
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut flags = Vec::new();
        if service_type.instance_behavior == berth::catalog::InstanceBehavior::Single {
            flags.push("single");
        }
        if service_type.auto_allocated {
            flags.push("auto");
        }
        if service_type.overlapping {
            flags.push("overlapping");
        }
        lines.push(format!(
            "{:<16} {:<13} preferred [{}]{}",
            service_type.name,
            service_type.range.to_string(),
            preferred.join(", "),
            if flags.is_empty() {
                String::new()
            } else {
                format!("  ({})", flags.join(", "))
            }
        ));
    }
    for warning in catalog.warnings() {
        lines.push(format!("warning: {warning}"));
    }

    let types: Value = catalog
        .iter()
        .map(|t| (t.name.clone(), serde_json::to_value(t.to_spec()).unwrap_or(Value::Null)))
        .collect::<serde_json::Map<String, Value>>()
        .into();
    emit(
        global,
        &lines.join("\n"),
        &json!({ "service_types": types, "warnings": catalog.warnings() }),
    );
    Ok(())
}

fn validate(global: &GlobalOptions) -> Result<(), CliError> {
    let (settings, catalog) = load_catalog(global)?;
    let warnings = catalog.warnings();
    emit(
        global,
        &if warnings.is_empty() {
            format!("{} is valid", settings.config_path().display())
        } else {
            format!(
                "{} is valid with {} warning(s):\n{}",
                settings.config_path().display(),
                warnings.len(),
                warnings.join("\n")
            )
        },
        &json!({ "valid": true, "warnings": warnings }),
    );
    Ok(())
}

fn generate(global: &GlobalOptions, force: bool) -> Result<(), CliError> {
    let settings = global.settings()?;
    let path = settings.config_path();
    if path.exists() && !force {
        return Err(CliError::SemanticFailure(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    ConfigFile::default()
        .store(&path)
        .map_err(CliError::Library)?;
    emit(
        global,
        &format!("wrote {}", path.display()),
        &json!({ "written": path }),
    );
    Ok(())
}

fn auto_status(global: &GlobalOptions) -> Result<(), CliError> {
    let settings = global.settings()?;
    let auto = &settings.auto_allocation;
    let rules: Vec<String> = auto
        .pattern_rules
        .iter()
        .map(|rule| format!("{} => chunk {}", rule.pattern, rule.chunk_size))
        .collect();
    emit(
        global,
        &format!(
            "auto-allocation {} (chunk {}, placement {:?}, ports {}-{}, gap {})\n{}",
            if auto.enabled { "enabled" } else { "disabled" },
            auto.default_chunk_size,
            auto.placement,
            auto.min_port,
            auto.max_port,
            auto.gap_size,
            if rules.is_empty() {
                "no pattern rules".to_string()
            } else {
                rules.join("\n")
            }
        ),
        &json!({
            "enabled": auto.enabled,
            "default_chunk_size": auto.default_chunk_size,
            "placement": auto.placement,
            "min_port": auto.min_port,
            "max_port": auto.max_port,
            "preserve_gaps": auto.preserve_gaps,
            "gap_size": auto.gap_size,
            "pattern_rules": rules,
        }),
    );
    Ok(())
}

fn auto_set_enabled(global: &GlobalOptions, enabled: bool) -> Result<(), CliError> {
    let settings = global.settings()?;
    let path = settings.config_path();
    let mut config = ConfigFile::load(&path).map_err(CliError::Library)?;
    config
        .auto_allocation
        .get_or_insert_with(Default::default)
        .enabled = Some(enabled);
    config.store(&path).map_err(CliError::Library)?;
    emit(
        global,
        &format!(
            "auto-allocation {} (restart the daemon for it to take effect)",
            if enabled { "enabled" } else { "disabled" }
        ),
        &json!({ "enabled": enabled }),
    );
    Ok(())
}

fn auto_undo(global: &GlobalOptions, service_type: &str) -> Result<(), CliError> {
    let settings = global.settings()?;
    let writer = CatalogWriter::new(settings.config_path(), settings.backups_dir());
    let removed = writer
        .remove_service_type(service_type)
        .map_err(CliError::Library)?;
    emit(
        global,
        &format!(
            "removed auto-allocated service type '{service_type}' (range {}-{})",
            removed.range[0], removed.range[1]
        ),
        &json!({ "removed": service_type, "range": removed.range }),
    );
    Ok(())
}

fn auto_list(global: &GlobalOptions) -> Result<(), CliError> {
    let settings = global.settings()?;
    let writer = CatalogWriter::new(settings.config_path(), settings.backups_dir());
    let entries = writer.list_auto_allocated().map_err(CliError::Library)?;

    let mut lines = Vec::with_capacity(entries.len() + 1);
    if entries.is_empty() {
        lines.push("no auto-allocated service types".to_string());
    }
    for (name, spec) in &entries {
        lines.push(format!(
            "{:<16} {}-{}  allocated {}",
            name,
            spec.range[0],
            spec.range[1],
            spec.allocated_at
                .map_or_else(|| "-".to_string(), |at| at.to_rfc3339()),
        ));
    }

    let json_entries: Vec<Value> = entries
        .iter()
        .map(|(name, spec)| json!({ "name": name, "range": spec.range, "allocated_at": spec.allocated_at }))
        .collect();
    emit(global, &lines.join("\n"), &json!({ "auto_allocated": json_entries }));
    Ok(())
}
