use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::LanguageOverride;

/// How an environment's code is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// In-process restricted interpreter
    Script,
    /// Locked-down container
    Container,
}

/// Static per-language descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnvironment {
    pub language_key: String,
    pub kind: ExecutionKind,
    pub container_image: String,
    /// Interpreted languages get the entry filename appended; compiled ones run the build output
    pub run_command: Vec<String>,
    /// File extension of the entry file, without the dot
    pub file_extension: String,
    /// Entry filename is appended; the program must land at /tmp/main
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_command: Option<Vec<String>>,
    /// Extra environment variables set inside the container
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Budget used instead of the global default when the request names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_memory_mb: Option<u64>,
}

impl ExecutionEnvironment {
    pub fn container(language_key: &str, image: &str, run: &[&str], extension: &str) -> Self {
        Self {
            language_key: language_key.to_string(),
            kind: ExecutionKind::Container,
            container_image: image.to_string(),
            run_command: run.iter().map(|s| s.to_string()).collect(),
            file_extension: extension.to_string(),
            compile_command: None,
            env: Vec::new(),
            default_timeout_ms: None,
            default_memory_mb: None,
        }
    }

    pub fn compiled(mut self, compile: &[&str]) -> Self {
        self.compile_command = Some(compile.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn script(mut self) -> Self {
        self.kind = ExecutionKind::Script;
        self
    }

    pub fn with_env(mut self, vars: &[&str]) -> Self {
        self.env = vars.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Toolchains that compile per request need more than the global defaults
    pub fn with_default_limits(mut self, timeout_ms: u64, memory_mb: u64) -> Self {
        self.default_timeout_ms = Some(timeout_ms);
        self.default_memory_mb = Some(memory_mb);
        self
    }

    fn apply_override(&mut self, overrides: &LanguageOverride) {
        if let Some(image) = &overrides.image {
            self.container_image = image.clone();
        }
        if let Some(run) = &overrides.run_command {
            self.run_command = run.clone();
        }
        if let Some(compile) = &overrides.compile_command {
            self.compile_command = Some(compile.clone());
        }
        if let Some(extension) = &overrides.file_extension {
            self.file_extension = extension.trim_start_matches('.').to_string();
        }
        if let Some(timeout_ms) = overrides.default_timeout_ms {
            self.default_timeout_ms = Some(timeout_ms);
        }
        if let Some(memory_mb) = overrides.default_memory_mb {
            self.default_memory_mb = Some(memory_mb);
        }
    }
}

/// Built-in environment table
pub fn builtin_environments() -> Vec<ExecutionEnvironment> {
    vec![
        ExecutionEnvironment::container("javascript", "node:20-alpine", &["node"], "js").script(),
        ExecutionEnvironment::container(
            "typescript",
            "denoland/deno:alpine",
            &["deno", "run", "--quiet", "--no-prompt"],
            "ts",
        )
        .with_env(&["DENO_DIR=/tmp/deno", "NO_COLOR=1"]),
        ExecutionEnvironment::container("python", "python:3.11-slim", &["python3", "-u"], "py"),
        ExecutionEnvironment::container("java", "eclipse-temurin:21-jdk", &["java"], "java")
            .with_env(&["JAVA_TOOL_OPTIONS=-Xss8m -XX:+UseSerialGC -XX:TieredStopAtLevel=1"])
            .with_default_limits(15_000, 256),
        ExecutionEnvironment::container("c", "gcc:13", &["/tmp/main"], "c")
            .compiled(&["gcc", "-O2", "-std=c11", "-o", "/tmp/main"]),
        ExecutionEnvironment::container("cpp", "gcc:13", &["/tmp/main"], "cpp")
            .compiled(&["g++", "-O2", "-std=c++17", "-o", "/tmp/main"]),
        // The golang images ship no prebuilt std, so every build compiles it
        // into a cold cache; keep it to one compiler process and one OS thread
        ExecutionEnvironment::container("go", "golang:1.22-alpine", &["/tmp/main"], "go")
            .compiled(&["go", "build", "-o", "/tmp/main"])
            .with_env(&[
                "GOCACHE=/tmp/gocache",
                "GOPATH=/tmp/go",
                "CGO_ENABLED=0",
                "GOFLAGS=-p=1",
                "GOMAXPROCS=1",
            ])
            .with_default_limits(25_000, 384),
        ExecutionEnvironment::container("rust", "rust:1.79-slim", &["/tmp/main"], "rs")
            .compiled(&["rustc", "-O", "-C", "codegen-units=1", "-o", "/tmp/main"])
            .with_default_limits(20_000, 256),
        ExecutionEnvironment::container("ruby", "ruby:3.3-alpine", &["ruby"], "rb"),
    ]
}

const ALIASES: &[(&str, &str)] = &[
    ("js", "javascript"),
    ("node", "javascript"),
    ("nodejs", "javascript"),
    ("ts", "typescript"),
    ("py", "python"),
    ("python3", "python"),
    ("c++", "cpp"),
    ("golang", "go"),
    ("rs", "rust"),
    ("rb", "ruby"),
];

/// Immutable language → environment table, built once at startup
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, ExecutionEnvironment>,
    aliases: HashMap<String, String>,
}

impl EnvironmentRegistry {
    /// Build a registry from an explicit table; keys are lowercased
    pub fn new(environments: Vec<ExecutionEnvironment>) -> Self {
        let environments = environments
            .into_iter()
            .map(|mut env| {
                env.language_key = env.language_key.to_lowercase();
                (env.language_key.clone(), env)
            })
            .collect::<HashMap<_, _>>();

        let aliases = ALIASES
            .iter()
            .filter(|(_, target)| environments.contains_key(*target))
            .map(|(alias, target)| (alias.to_string(), target.to_string()))
            .collect();

        Self { environments, aliases }
    }

    /// The built-in table
    pub fn builtin() -> Self {
        Self::new(builtin_environments())
    }

    /// The built-in table with configuration overrides applied
    pub fn with_overrides(overrides: &HashMap<String, LanguageOverride>) -> Self {
        let mut environments = builtin_environments();

        for (key, language_override) in overrides {
            let key = key.to_lowercase();
            match environments.iter_mut().find(|env| env.language_key == key) {
                Some(env) => {
                    debug!(language = %key, "Applying language override");
                    env.apply_override(language_override);
                }
                None => warn!(language = %key, "Ignoring override for unknown language"),
            }
        }

        Self::new(environments)
    }

    /// Case-insensitive lookup by canonical key or alias
    pub fn lookup(&self, language_key: &str) -> Option<&ExecutionEnvironment> {
        let key = language_key.trim().to_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.environments.get(key)
    }

    /// Sorted canonical language keys
    pub fn languages(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.environments.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}
