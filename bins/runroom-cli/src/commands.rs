// CLI commands for managing Runroom languages and project layout
use anyhow::{bail, Context, Result};
use runroom_core::languages::LanguageConfig;
use runroom_core::LanguageConfigManager;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Load languages.json the way the servers do, treating a missing file as an empty set
fn load_languages_config(config_path: &Path) -> Result<LanguageConfigManager> {
    if !config_path.exists() {
        return Ok(LanguageConfigManager::default());
    }
    LanguageConfigManager::load(config_path)
}

/// Add a new language
pub fn add_language(
    config_path: &Path,
    name: &str,
    ext: &str,
    command: Option<&str>,
    args: &[String],
    version: &str,
) -> Result<()> {
    println!("🚀 Adding language: {}", name);

    // Validate inputs
    let ext = ext.trim_start_matches('.');
    if name.trim().is_empty() || ext.is_empty() {
        bail!("Language name and extension cannot be empty");
    }

    let mut languages = load_languages_config(config_path)?;
    if languages.get_config(name).is_some() {
        bail!("Language '{}' already exists in config", name);
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut config = LanguageConfig::new(name, command.unwrap_or(name), &arg_refs, ext);
    config.version = version.to_string();
    languages.insert(config);

    println!("📝 Updating {}...", config_path.display());
    languages.save(config_path)?;

    println!("✅ Language '{}' added successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Make sure '{}' is installed on every worker host", command.unwrap_or(name));
    println!("  2. Restart runroom-api / runroom-worker to pick up the change");

    Ok(())
}

/// Remove a language
pub fn remove_language(config_path: &Path, name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    let mut languages = load_languages_config(config_path)?;
    if languages.get_config(name).is_none() {
        bail!("Language '{}' not found in config", name);
    }
    if languages.list_languages().len() == 1 {
        bail!(
            "'{}' is the last configured language; servers refuse an empty list. Add another first",
            name
        );
    }

    // Confirm deletion
    if !yes {
        print!("⚠️  This will remove '{}' from {}\n", name, config_path.display());
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    languages.remove(name);
    println!("📝 Updating {}...", config_path.display());
    languages.save(config_path)?;

    println!("✅ Language '{}' removed successfully!", name);
    Ok(())
}

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let languages = load_languages_config(config_path)?;

    if languages.list_languages().is_empty() {
        println!("No languages configured.");
        println!("\n💡 Add a language with: runroom-cli add-lang --name <name> --ext <ext>");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<10} {:<8} {:<40}", "Name", "Version", "Ext", "Command");
    println!("{}", "─".repeat(72));

    for lang in languages.iter() {
        let command_line = std::iter::once(lang.execution.command.as_str())
            .chain(lang.execution.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<12} {:<10} {:<8} {:<40}",
            lang.name,
            lang.version,
            lang.extension(),
            command_line
        );
    }

    println!("\n✅ Total: {} language(s)", languages.list_languages().len());

    Ok(())
}

/// Initialize a new Runroom project
pub fn init_project(project_path: &Path) -> Result<()> {
    println!("🚀 Initializing Runroom project at: {}", project_path.display());

    // Create directories
    let dirs = ["config", "codes"];

    for dir in &dirs {
        let dir_path = project_path.join(dir);
        fs::create_dir_all(&dir_path)
            .with_context(|| format!("Failed to create directory: {}", dir))?;
        println!("  ✅ Created: {}", dir);
    }

    // Create default languages.json
    let languages_json_path = project_path.join("config/languages.json");
    if !languages_json_path.exists() {
        LanguageConfigManager::builtin().save(&languages_json_path)?;
        println!("  ✅ Created: config/languages.json");
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Add a language: runroom-cli add-lang --name ruby --ext rb");
    println!("  2. Set REDIS_URL and start runroom-api");
    println!("  3. Scale out with runroom-worker (WORKER_COUNT per process)");

    Ok(())
}
