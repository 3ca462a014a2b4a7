//! Per-project `autocoder.yaml` configuration: built-in presets plus
//! user overrides, merged the way `original_source/core/project_config.py`
//! does it. Distinct from the engine-level [`crate::config::AutocoderConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub timeout_s: Option<u64>,
    pub allow_fail: bool,
}

/// Review gate mode. Only a `command`-type reviewer is supported; the
/// `claude`/`multi_cli` reviewer backends from the original are out of
/// scope here (no bundled AI CLI integration layer in this engine) and are
/// parsed only far enough to be rejected with a clear error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewMode {
    Off,
    Advisory,
    Gate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewerType {
    None,
    Command,
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct ReviewSpec {
    pub enabled: bool,
    pub mode: ReviewMode,
    pub reviewer_type: ReviewerType,
    pub command: Option<String>,
    pub timeout_s: Option<u64>,
}

impl Default for ReviewSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ReviewMode::Off,
            reviewer_type: ReviewerType::None,
            command: None,
            timeout_s: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedProjectConfig {
    pub preset: Option<String>,
    pub commands: BTreeMap<String, CommandSpec>,
    pub review: ReviewSpec,
}

impl ResolvedProjectConfig {
    pub fn get_command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }
}

#[derive(Debug, Deserialize)]
struct RawYamlConfig {
    preset: Option<String>,
    #[serde(default)]
    commands: BTreeMap<String, JsonValue>,
    review: Option<RawReview>,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(default)]
    enabled: bool,
    mode: Option<String>,
    #[serde(rename = "type")]
    reviewer_type: Option<String>,
    command: Option<String>,
    timeout: Option<u64>,
}

fn command_spec_from_value(value: &JsonValue) -> Option<CommandSpec> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(CommandSpec {
                    command: trimmed.to_string(),
                    timeout_s: None,
                    allow_fail: false,
                })
            }
        }
        JsonValue::Object(map) => {
            let command = map.get("command")?.as_str()?.trim().to_string();
            if command.is_empty() {
                return None;
            }
            let timeout_s = map.get("timeout").and_then(|v| v.as_u64());
            let allow_fail = map
                .get("allow_fail")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Some(CommandSpec {
                command,
                timeout_s,
                allow_fail,
            })
        }
        _ => None,
    }
}

pub fn builtin_presets() -> BTreeMap<&'static str, BTreeMap<&'static str, CommandSpec>> {
    fn cmd(command: &str, timeout_s: u64, allow_fail: bool) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            timeout_s: Some(timeout_s),
            allow_fail,
        }
    }

    let mut presets = BTreeMap::new();

    presets.insert(
        "python",
        BTreeMap::from([
            (
                "setup",
                cmd(
                    "{PY} -m venv .venv && {VENV_PY} -m pip install -U pip && {VENV_PY} -m pip install -r requirements.txt",
                    900,
                    false,
                ),
            ),
            ("test", cmd("{VENV_PY} -m pytest -q", 900, false)),
        ]),
    );

    presets.insert(
        "python-uv",
        BTreeMap::from([
            ("setup", cmd("uv sync", 900, false)),
            ("test", cmd("uv run pytest", 900, false)),
            ("lint", cmd("uvx ruff check .", 600, false)),
            ("format", cmd("uvx ruff format .", 600, false)),
            ("typecheck", cmd("uvx mypy .", 900, true)),
        ]),
    );

    presets.insert(
        "node-npm",
        BTreeMap::from([
            ("setup", cmd("npm install", 900, false)),
            ("test", cmd("npm test", 900, false)),
            ("lint", cmd("npm run lint", 600, true)),
            ("typecheck", cmd("npm run typecheck", 900, true)),
        ]),
    );

    presets.insert(
        "go",
        BTreeMap::from([
            ("setup", cmd("go mod download", 900, false)),
            ("test", cmd("go test ./...", 900, false)),
            ("lint", cmd("golangci-lint run", 900, true)),
        ]),
    );

    presets.insert(
        "rust",
        BTreeMap::from([
            ("setup", cmd("cargo fetch", 900, false)),
            ("test", cmd("cargo test", 1800, false)),
            (
                "lint",
                cmd(
                    "cargo clippy --all-targets --all-features -- -D warnings",
                    1800,
                    true,
                ),
            ),
            ("format", cmd("cargo fmt -- --check", 600, true)),
        ]),
    );

    presets
}

fn read_npm_scripts(project_dir: &Path) -> BTreeMap<String, JsonValue> {
    let pkg = project_dir.join("package.json");
    let Ok(data) = std::fs::read_to_string(&pkg) else {
        return BTreeMap::new();
    };
    let Ok(parsed) = serde_json::from_str::<JsonValue>(&data) else {
        return BTreeMap::new();
    };
    parsed
        .get("scripts")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Synthesizes a minimal, deterministic command set from a built-in preset
/// when no `autocoder.yaml` is present.
pub fn synthesize_commands_from_preset(
    preset: &str,
    project_dir: &Path,
) -> BTreeMap<String, CommandSpec> {
    let presets = builtin_presets();
    let mut cmds: BTreeMap<String, CommandSpec> = presets
        .get(preset)
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    if preset != "node-npm" {
        return cmds;
    }

    let scripts = read_npm_scripts(project_dir);
    if !scripts.contains_key("test") {
        cmds.remove("test");
    }
    if !scripts.contains_key("lint") {
        cmds.remove("lint");
    }

    let typecheck_key = if scripts.contains_key("typecheck") {
        Some("typecheck")
    } else if scripts.contains_key("type-check") {
        Some("type-check")
    } else {
        None
    };
    match typecheck_key {
        None => {
            cmds.remove("typecheck");
        }
        Some(key) => {
            cmds.insert(
                "typecheck".to_string(),
                CommandSpec {
                    command: format!("npm run {key}"),
                    timeout_s: Some(900),
                    allow_fail: true,
                },
            );
        }
    }

    if scripts.contains_key("build") {
        cmds.insert(
            "build".to_string(),
            CommandSpec {
                command: "npm run build".to_string(),
                timeout_s: Some(1800),
                allow_fail: false,
            },
        );
    }

    cmds
}

/// Loads `<project_dir>/autocoder.yaml`. Missing or invalid config returns
/// an empty config so callers fall back to preset inference.
pub fn load_project_config(project_dir: &Path) -> ResolvedProjectConfig {
    let cfg_path = project_dir.join("autocoder.yaml");
    let Ok(raw) = std::fs::read_to_string(&cfg_path) else {
        return ResolvedProjectConfig::default();
    };
    let Ok(parsed) = serde_yaml::from_str::<RawYamlConfig>(&raw) else {
        return ResolvedProjectConfig::default();
    };

    let preset = parsed
        .preset
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let presets = builtin_presets();
    let mut commands: BTreeMap<String, CommandSpec> = preset
        .as_deref()
        .and_then(|p| presets.get(p))
        .map(|m| m.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
        .unwrap_or_default();

    for (name, value) in &parsed.commands {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match command_spec_from_value(value) {
            Some(spec) => {
                commands.insert(name.to_string(), spec);
            }
            None => {
                commands.remove(name);
            }
        }
    }

    let review = parsed
        .review
        .map(|r| {
            let mode = match r.mode.as_deref().map(str::to_lowercase).as_deref() {
                Some("advisory") => ReviewMode::Advisory,
                Some("gate") => ReviewMode::Gate,
                _ => ReviewMode::Off,
            };
            let reviewer_type = match r.reviewer_type.as_deref().map(str::to_lowercase).as_deref() {
                Some("command") => ReviewerType::Command,
                Some(other @ ("claude" | "multi_cli")) => ReviewerType::Unsupported(other.to_string()),
                _ => ReviewerType::None,
            };
            ReviewSpec {
                enabled: r.enabled,
                mode,
                reviewer_type,
                command: r.command.filter(|s| !s.trim().is_empty()),
                timeout_s: r.timeout,
            }
        })
        .unwrap_or_default();

    ResolvedProjectConfig {
        preset,
        commands,
        review,
    }
}

pub fn infer_preset(project_dir: &Path) -> Option<&'static str> {
    if project_dir.join("pyproject.toml").exists() && project_dir.join("uv.lock").exists() {
        return Some("python-uv");
    }
    if project_dir.join("requirements.txt").exists() {
        return Some("python");
    }
    if project_dir.join("package.json").exists() {
        return Some("node-npm");
    }
    if project_dir.join("go.mod").exists() {
        return Some("go");
    }
    if project_dir.join("Cargo.toml").exists() {
        return Some("rust");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn infer_preset_detects_rust() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(infer_preset(dir.path()), Some("rust"));
    }

    #[test]
    fn missing_autocoder_yaml_returns_empty_config() {
        let dir = TempDir::new().unwrap();
        let cfg = load_project_config(dir.path());
        assert!(cfg.preset.is_none());
        assert!(cfg.commands.is_empty());
    }

    #[test]
    fn user_commands_override_preset_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("autocoder.yaml"),
            "preset: rust\ncommands:\n  test: cargo test --all\n",
        )
        .unwrap();
        let cfg = load_project_config(dir.path());
        assert_eq!(cfg.preset.as_deref(), Some("rust"));
        assert_eq!(cfg.get_command("test").unwrap().command, "cargo test --all");
        assert!(cfg.get_command("setup").is_some());
    }

    #[test]
    fn node_preset_drops_missing_scripts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"build": "tsc"}}"#,
        )
        .unwrap();
        let cmds = synthesize_commands_from_preset("node-npm", dir.path());
        assert!(!cmds.contains_key("test"));
        assert!(!cmds.contains_key("lint"));
        assert!(cmds.contains_key("build"));
    }
}
