//! Language runners: how to launch a service that declares no `command`.
//!
//! New languages are added by implementing [`Runner`] and registering it
//! with [`RunnerRegistry::register`].

use crate::config::ServiceSpec;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Launch knowledge for one language ecosystem.
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Language hints (lowercase) this runner answers to.
    fn aliases(&self) -> &'static [&'static str];

    /// Whether `dir` looks like a project of this language.
    fn detect(&self, dir: &Path) -> bool;

    /// Command that starts the project in `dir`.
    fn command(&self, spec: &ServiceSpec, dir: &Path) -> Option<String>;

    /// Port the ecosystem's dev server listens on by default.
    fn default_port(&self, framework: Option<&str>) -> u16;
}

fn framework_default_port(framework: Option<&str>) -> Option<u16> {
    let port = match framework?.to_ascii_lowercase().as_str() {
        "next.js" | "nextjs" | "express" | "nestjs" | "remix" | "nuxt" => 3000,
        "react" | "vue" | "svelte" | "vite" => 5173,
        "angular" => 4200,
        "astro" => 4321,
        "django" | "fastapi" => 8000,
        "flask" | "asp.net core" | "aspnetcore" | "blazor" => 5000,
        "streamlit" => 8501,
        "gradio" => 7860,
        "spring boot" | "quarkus" | "micronaut" => 8080,
        _ => return None,
    };
    Some(port)
}

pub struct NodeRunner;

impl NodeRunner {
    fn package_manager(dir: &Path) -> &'static str {
        if dir.join("pnpm-lock.yaml").exists() {
            "pnpm"
        } else if dir.join("yarn.lock").exists() {
            "yarn"
        } else {
            "npm"
        }
    }

    fn has_script(dir: &Path, script: &str) -> bool {
        std::fs::read_to_string(dir.join("package.json"))
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .map(|pkg| pkg["scripts"][script].is_string())
            .unwrap_or(false)
    }
}

impl Runner for NodeRunner {
    fn name(&self) -> &'static str {
        "node"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["node", "nodejs", "javascript", "js", "typescript", "ts"]
    }

    fn detect(&self, dir: &Path) -> bool {
        dir.join("package.json").exists()
    }

    fn command(&self, _spec: &ServiceSpec, dir: &Path) -> Option<String> {
        let pm = Self::package_manager(dir);
        let script = if Self::has_script(dir, "dev") { "dev" } else { "start" };
        Some(format!("{} run {}", pm, script))
    }

    fn default_port(&self, framework: Option<&str>) -> u16 {
        framework_default_port(framework).unwrap_or(3000)
    }
}

pub struct PythonRunner;

impl PythonRunner {
    fn interpreter(dir: &Path) -> String {
        for venv in [".venv", "venv"] {
            let python = dir.join(venv).join("bin").join("python");
            if python.exists() {
                return python.display().to_string();
            }
        }
        "python3".to_string()
    }

    fn entrypoint(dir: &Path) -> Option<&'static str> {
        ["main", "app", "server"]
            .into_iter()
            .find(|name| dir.join(format!("{}.py", name)).exists())
    }
}

impl Runner for PythonRunner {
    fn name(&self) -> &'static str {
        "python"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["python", "py"]
    }

    fn detect(&self, dir: &Path) -> bool {
        ["pyproject.toml", "requirements.txt", "manage.py"]
            .iter()
            .any(|f| dir.join(f).exists())
    }

    fn command(&self, spec: &ServiceSpec, dir: &Path) -> Option<String> {
        let python = Self::interpreter(dir);
        let framework = spec.framework.as_deref().map(str::to_ascii_lowercase);

        if dir.join("manage.py").exists() {
            return Some(format!("{} manage.py runserver 0.0.0.0:${{PORT}}", python));
        }
        let entry = Self::entrypoint(dir)?;
        match framework.as_deref() {
            Some("fastapi") => Some(format!(
                "{} -m uvicorn {}:app --reload --host 0.0.0.0 --port ${{PORT}}",
                python, entry
            )),
            Some("flask") => Some(format!(
                "{} -m flask --app {} run --host 0.0.0.0 --port ${{PORT}}",
                python, entry
            )),
            _ => Some(format!("{} {}.py", python, entry)),
        }
    }

    fn default_port(&self, framework: Option<&str>) -> u16 {
        framework_default_port(framework).unwrap_or(8000)
    }
}

pub struct GoRunner;

impl Runner for GoRunner {
    fn name(&self) -> &'static str {
        "go"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["go", "golang"]
    }

    fn detect(&self, dir: &Path) -> bool {
        dir.join("go.mod").exists()
    }

    fn command(&self, _spec: &ServiceSpec, _dir: &Path) -> Option<String> {
        Some("go run .".to_string())
    }

    fn default_port(&self, framework: Option<&str>) -> u16 {
        framework_default_port(framework).unwrap_or(8080)
    }
}

pub struct RustRunner;

impl Runner for RustRunner {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["rust", "rs"]
    }

    fn detect(&self, dir: &Path) -> bool {
        dir.join("Cargo.toml").exists()
    }

    fn command(&self, _spec: &ServiceSpec, _dir: &Path) -> Option<String> {
        Some("cargo run".to_string())
    }

    fn default_port(&self, framework: Option<&str>) -> u16 {
        framework_default_port(framework).unwrap_or(8080)
    }
}

pub struct DotnetRunner;

impl Runner for DotnetRunner {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["dotnet", ".net", "csharp", "c#", "fsharp"]
    }

    fn detect(&self, dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries.flatten().any(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.ends_with(".csproj") || name.ends_with(".fsproj")
                })
            })
            .unwrap_or(false)
    }

    fn command(&self, _spec: &ServiceSpec, _dir: &Path) -> Option<String> {
        Some("dotnet run".to_string())
    }

    fn default_port(&self, framework: Option<&str>) -> u16 {
        framework_default_port(framework).unwrap_or(5000)
    }
}

/// Ordered set of runners. Explicit language hints win over detection.
pub struct RunnerRegistry {
    runners: Vec<Box<dyn Runner>>,
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.runners.iter().map(|r| r.name()))
            .finish()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(NodeRunner));
        registry.register(Box::new(PythonRunner));
        registry.register(Box::new(GoRunner));
        registry.register(Box::new(RustRunner));
        registry.register(Box::new(DotnetRunner));
        registry
    }
}

impl RunnerRegistry {
    pub fn empty() -> Self {
        Self {
            runners: Vec::new(),
        }
    }

    pub fn register(&mut self, runner: Box<dyn Runner>) {
        self.runners.push(runner);
    }

    pub fn by_language(&self, language: &str) -> Option<&dyn Runner> {
        let language = language.to_ascii_lowercase();
        self.runners
            .iter()
            .find(|r| r.aliases().contains(&language.as_str()))
            .map(|r| r.as_ref())
    }

    pub fn detect(&self, dir: &Path) -> Option<&dyn Runner> {
        self.runners
            .iter()
            .find(|r| r.detect(dir))
            .map(|r| r.as_ref())
    }

    /// Runner for `spec`: its `language` hint if one matches, else whatever
    /// `dir` looks like.
    pub fn resolve(&self, spec: &ServiceSpec, dir: &Path) -> Option<&dyn Runner> {
        spec.language
            .as_deref()
            .and_then(|lang| self.by_language(lang))
            .or_else(|| self.detect(dir))
    }

    /// The launch command: an explicit `command` always wins.
    pub fn command_for(&self, spec: &ServiceSpec, dir: &Path) -> Option<String> {
        if let Some(cmd) = spec.command.as_deref().filter(|c| !c.trim().is_empty()) {
            return Some(cmd.to_string());
        }
        self.resolve(spec, dir)?.command(spec, dir)
    }

    /// Port to ask the port manager for, and whether it is explicit.
    ///
    /// Explicit config, then a `--port N`/`:N` in the command, then
    /// `<NAME>_PORT` from `env`, then the runner's default, then 0 (any).
    pub fn preferred_port(
        &self,
        spec: &ServiceSpec,
        dir: &Path,
        env: &std::collections::HashMap<String, String>,
    ) -> (u16, bool) {
        if let Some(port_spec) = spec.primary_port() {
            if let Some(port) = port_spec.port() {
                return (port, port_spec.is_explicit());
            }
        }
        if let Some(port) = spec.command.as_deref().and_then(port_from_command) {
            return (port, false);
        }
        if let Some(port) = env
            .get(&port_env_var(&spec.name))
            .and_then(|v| v.trim().parse::<u16>().ok())
            .filter(|p| *p > 0)
        {
            return (port, false);
        }
        let port = self
            .resolve(spec, dir)
            .map(|r| r.default_port(spec.framework.as_deref()))
            .unwrap_or(0);
        (port, false)
    }
}

/// `api-gateway` -> `API_GATEWAY_PORT`.
pub fn port_env_var(service: &str) -> String {
    let mut name: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    name.push_str("_PORT");
    name
}

/// Port mentioned in a launch command (`--port 3000`, `--port=3000`, `:3000`).
pub fn port_from_command(command: &str) -> Option<u16> {
    static PORT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PORT_RE
        .get_or_init(|| Regex::new(r"(?:--port[=\s]+|-p[=\s]+|:)(\d{2,5})\b").ok())
        .as_ref()?;
    re.captures(command)?
        .get(1)?
        .as_str()
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortSpec;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_detection_signals() {
        let registry = RunnerRegistry::default();
        let dir = TempDir::new().unwrap();
        assert!(registry.detect(dir.path()).is_none());

        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert_eq!(registry.detect(dir.path()).unwrap().name(), "go");

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Api.csproj"), "<Project/>").unwrap();
        assert_eq!(registry.detect(dir.path()).unwrap().name(), "dotnet");
    }

    #[test]
    fn test_language_hint_beats_detection() {
        let registry = RunnerRegistry::default();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let mut spec = ServiceSpec::new("svc");
        spec.language = Some("Python".into());
        assert_eq!(registry.resolve(&spec, dir.path()).unwrap().name(), "python");

        spec.language = Some("cobol".into());
        assert_eq!(registry.resolve(&spec, dir.path()).unwrap().name(), "node");
    }

    #[test]
    fn test_node_command_prefers_dev_script() {
        let registry = RunnerRegistry::default();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite", "start": "node ."}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let spec = ServiceSpec::new("web");
        assert_eq!(
            registry.command_for(&spec, dir.path()).as_deref(),
            Some("yarn run dev")
        );
    }

    #[test]
    fn test_explicit_command_wins() {
        let registry = RunnerRegistry::default();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let spec = ServiceSpec::new("api").with_command("./run.sh");
        assert_eq!(
            registry.command_for(&spec, dir.path()).as_deref(),
            Some("./run.sh")
        );
    }

    #[test]
    fn test_preferred_port_chain() {
        let registry = RunnerRegistry::default();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let mut env = HashMap::new();

        let spec = ServiceSpec::new("web").with_port(PortSpec::explicit(8080));
        assert_eq!(registry.preferred_port(&spec, dir.path(), &env), (8080, true));

        let spec = ServiceSpec::new("web").with_command("vite --port 4100");
        assert_eq!(registry.preferred_port(&spec, dir.path(), &env), (4100, false));

        env.insert("WEB_PORT".to_string(), "4200".to_string());
        let spec = ServiceSpec::new("web");
        assert_eq!(registry.preferred_port(&spec, dir.path(), &env), (4200, false));

        env.clear();
        let mut spec = ServiceSpec::new("web");
        spec.framework = Some("React".into());
        assert_eq!(registry.preferred_port(&spec, dir.path(), &env), (5173, false));

        let empty = TempDir::new().unwrap();
        assert_eq!(
            registry.preferred_port(&ServiceSpec::new("x"), empty.path(), &env),
            (0, false)
        );
    }

    #[test]
    fn test_port_from_command() {
        assert_eq!(port_from_command("uvicorn app:app --port 8001"), Some(8001));
        assert_eq!(port_from_command("serve --port=9000"), Some(9000));
        assert_eq!(port_from_command("python -m http.server"), None);
        assert_eq!(port_env_var("api-gateway"), "API_GATEWAY_PORT");
    }
}
