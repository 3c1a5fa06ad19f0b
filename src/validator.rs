use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::runtime::ExecutionRequest;

/// Reasons a request is rejected before any resource is allocated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Source code is empty")]
    EmptyCode,

    #[error("Requester id is empty")]
    EmptyRequester,

    #[error("Language is empty")]
    EmptyLanguage,

    #[error("Source code is {length} characters, limit is {limit}")]
    CodeTooLarge { length: usize, limit: usize },

    #[error("Timeout of {requested} ms exceeds the limit of {limit} ms")]
    TimeoutTooLarge { requested: u64, limit: u64 },

    #[error("Memory limit of {requested} MB exceeds the limit of {limit} MB")]
    MemoryLimitTooHigh { requested: u64, limit: u64 },

    #[error("Disallowed code pattern: {description}")]
    DangerousPattern {
        risk: RiskClass,
        description: &'static str,
    },
}

/// Risk classes covered by the deny-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskClass {
    FilesystemAccess,
    ProcessSpawn,
    RawSocket,
    ProcessTermination,
    SystemHeader,
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskClass::FilesystemAccess => "filesystem access",
            RiskClass::ProcessSpawn => "process spawning",
            RiskClass::RawSocket => "raw network socket",
            RiskClass::ProcessTermination => "process termination",
            RiskClass::SystemHeader => "system header",
        };
        f.write_str(name)
    }
}

struct DenyPattern {
    regex: Regex,
    risk: RiskClass,
    description: &'static str,
}

const DENY_LIST: &[(&str, RiskClass, &str)] = &[
    // Filesystem modules
    (r#"require\s*\(\s*['"](?:node:)?fs(?:/promises)?['"]\s*\)"#, RiskClass::FilesystemAccess, "Node.js fs module"),
    (r#"\bfrom\s+['"](?:node:)?fs(?:/promises)?['"]"#, RiskClass::FilesystemAccess, "Node.js fs module"),
    (r"(?m)^\s*(?:import|from)\s+(?:os|shutil|pathlib)\b", RiskClass::FilesystemAccess, "Python os/shutil/pathlib module"),
    (r"\bjava\.nio\.file\b|\bjava\.io\.File(?:Writer|OutputStream|InputStream|Reader)?\b", RiskClass::FilesystemAccess, "Java file API"),
    (r"\bstd::fs\b", RiskClass::FilesystemAccess, "Rust std::fs"),
    (r"\bDeno\.(?:readFile|writeFile|readTextFile|writeTextFile|remove|open)", RiskClass::FilesystemAccess, "Deno filesystem API"),
    // Process spawning
    (r#"require\s*\(\s*['"](?:node:)?child_process['"]\s*\)|\bfrom\s+['"](?:node:)?child_process['"]"#, RiskClass::ProcessSpawn, "Node.js child_process module"),
    (r"(?m)^\s*(?:import|from)\s+(?:subprocess|multiprocessing|pty)\b", RiskClass::ProcessSpawn, "Python process module"),
    (r"\bos\.(?:system|popen|spawn\w*|exec\w*|fork)\s*\(", RiskClass::ProcessSpawn, "Python os process call"),
    (r"\bRuntime\.getRuntime\s*\(\s*\)\s*\.\s*exec\b|\bProcessBuilder\b", RiskClass::ProcessSpawn, "Java process API"),
    (r#""os/exec""#, RiskClass::ProcessSpawn, "Go os/exec package"),
    (r"\bstd::process::Command\b|\bprocess::Command::new\b", RiskClass::ProcessSpawn, "Rust process::Command"),
    (r"\b(?:system|popen|fork|vfork|execl|execlp|execle|execv|execvp|execve)\s*\(", RiskClass::ProcessSpawn, "C process call"),
    (r"\bDeno\.(?:run|Command)\b", RiskClass::ProcessSpawn, "Deno subprocess API"),
    // Raw sockets
    (r#"require\s*\(\s*['"](?:node:)?(?:net|dgram|tls|http|https)['"]\s*\)|\bfrom\s+['"](?:node:)?(?:net|dgram|tls|http|https)['"]"#, RiskClass::RawSocket, "Node.js network module"),
    (r"(?m)^\s*(?:import|from)\s+(?:socket|socketserver|urllib|http\.client|requests)\b", RiskClass::RawSocket, "Python network module"),
    (r"\bjava\.net\b", RiskClass::RawSocket, "Java network API"),
    (r#""net(?:/http)?""#, RiskClass::RawSocket, "Go net package"),
    (r"\bstd::net\b", RiskClass::RawSocket, "Rust std::net"),
    (r"\bDeno\.(?:connect|listen)\w*\b", RiskClass::RawSocket, "Deno socket API"),
    // Process termination
    (r"\bprocess\s*\.\s*(?:exit|kill|abort)\s*\(", RiskClass::ProcessTermination, "Node.js process termination"),
    (r"\bos\.(?:kill|_exit|abort)\s*\(", RiskClass::ProcessTermination, "Python os termination call"),
    (r"\bSystem\s*\.\s*exit\s*\(|\bRuntime\.getRuntime\s*\(\s*\)\s*\.\s*(?:halt|exit)\b", RiskClass::ProcessTermination, "Java VM termination"),
    (r"\bstd::process::(?:exit|abort)\b", RiskClass::ProcessTermination, "Rust process termination"),
    (r"\b(?:kill|raise)\s*\(\s*[\w-]+\s*,", RiskClass::ProcessTermination, "C signal call"),
    // Unrestricted system headers
    (r"#\s*include\s*<\s*(?:sys/|unistd\.h|signal\.h|netinet/|arpa/|netdb\.h|dlfcn\.h|spawn\.h)", RiskClass::SystemHeader, "Unrestricted system header"),
    (r#"#\s*include\s*<\s*(?:windows\.h|winsock2?\.h)\s*>"#, RiskClass::SystemHeader, "Unrestricted system header"),
];

lazy_static! {
    static ref DENY_PATTERNS: Vec<DenyPattern> = DENY_LIST
        .iter()
        .filter_map(|(pattern, risk, description)| match Regex::new(pattern) {
            Ok(regex) => Some(DenyPattern {
                regex,
                risk: *risk,
                description: *description,
            }),
            Err(e) => {
                tracing::error!("Invalid deny-list pattern {}: {}", pattern, e);
                None
            }
        })
        .collect();
}

/// Gatekeeper applied to every request before execution
#[derive(Debug, Clone)]
pub struct RequestValidator {
    limits: LimitsConfig,
}

impl RequestValidator {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Accepts the request or names the first rule it breaks
    pub fn validate(&self, request: &ExecutionRequest) -> Result<(), ValidationError> {
        let source = &request.source_code;

        if source.trim().is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        if request.requester_id.trim().is_empty() {
            return Err(ValidationError::EmptyRequester);
        }
        if request.language.trim().is_empty() {
            return Err(ValidationError::EmptyLanguage);
        }

        let length = source.chars().count();
        if length > self.limits.max_code_chars {
            return Err(ValidationError::CodeTooLarge {
                length,
                limit: self.limits.max_code_chars,
            });
        }

        if let Some(requested) = request.timeout_ms {
            if requested > self.limits.max_timeout_ms {
                return Err(ValidationError::TimeoutTooLarge {
                    requested,
                    limit: self.limits.max_timeout_ms,
                });
            }
        }

        if let Some(requested) = request.memory_limit_mb {
            if requested > self.limits.max_memory_mb {
                return Err(ValidationError::MemoryLimitTooHigh {
                    requested,
                    limit: self.limits.max_memory_mb,
                });
            }
        }

        check_for_dangerous_code(source)
    }
}

/// Lexical deny-list scan over raw source, independent of language
pub fn check_for_dangerous_code(content: &str) -> Result<(), ValidationError> {
    match DENY_PATTERNS.iter().find(|p| p.regex.is_match(content)) {
        Some(pattern) => {
            debug!(risk = %pattern.risk, "Deny-list pattern matched: {}", pattern.description);
            Err(ValidationError::DangerousPattern {
                risk: pattern.risk,
                description: pattern.description,
            })
        }
        None => Ok(()),
    }
}
