//! 代码校验
//!
//! 在构建前检查应用名、Python 语法和禁止的调用。
//! 语法树由 tree-sitter-python 生成，校验本身无副作用。

use tree_sitter::{Language, Node, Parser};

use crate::config::env::constants::MAX_APP_NAME_LEN;
use crate::domain::validation::{Rejection, RejectionReason, ValidationResult};

/// 禁止导入的模块
const FORBIDDEN_MODULES: &[&str] = &["subprocess", "pty", "commands", "pexpect"];

/// 禁止调用的内置函数
const FORBIDDEN_BUILTINS: &[&str] = &["eval", "exec", "compile", "__import__"];

/// 禁止调用的函数（精确匹配）
const FORBIDDEN_CALLS: &[&str] = &["os.system", "os.popen", "pty.spawn"];

/// 禁止调用的函数前缀
const FORBIDDEN_CALL_PREFIXES: &[&str] = &[
    "os.fork",
    "os.exec",
    "os.spawn",
    "os.posix_spawn",
    "subprocess.",
];

/// 字符串字面量里不允许出现的路径
const FORBIDDEN_PATHS: &[&str] = &[
    "../",
    "..\\",
    "/etc/",
    "/proc/",
    "/sys/",
    "/root/",
    "/var/run/docker.sock",
];

/// 应用名是否合法：小写字母数字和连字符，以字母开头、字母或数字结尾
///
/// 名称会直接用作 Service 名（DNS-1035 label），所以不能以数字开头
pub fn is_valid_app_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_APP_NAME_LEN {
        return false;
    }
    let allowed = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.iter().all(|b| allowed(b) || *b == b'-')
        && bytes.first().is_some_and(u8::is_ascii_lowercase)
        && bytes.last().is_some_and(allowed)
}

/// 代码校验器
#[derive(Clone)]
pub struct CodeValidator {
    language: Language,
}

impl CodeValidator {
    pub fn new() -> Self {
        Self {
            language: tree_sitter_python::LANGUAGE.into(),
        }
    }

    /// 按顺序校验：应用名 → 语法 → 策略，遇到第一个问题即返回
    pub fn validate(&self, app_name: &str, source_code: &str) -> ValidationResult {
        let app_name = app_name.trim();
        if !is_valid_app_name(app_name) {
            return ValidationResult::invalid(Rejection::new(
                RejectionReason::InvalidAppName,
                format!(
                    "'{}' must be 1-{} lowercase letters, digits or '-', starting with a letter and ending with a letter or digit",
                    app_name, MAX_APP_NAME_LEN
                ),
            ));
        }

        if let Err(rejection) = self.check_source(source_code) {
            return ValidationResult::invalid(rejection);
        }

        ValidationResult::valid(app_name)
    }

    fn check_source(&self, source_code: &str) -> Result<(), Rejection> {
        if source_code.trim().is_empty() {
            return Err(Rejection::new(
                RejectionReason::SyntaxError,
                "source code is empty",
            ));
        }

        let mut parser = Parser::new();
        parser.set_language(&self.language).map_err(|e| {
            Rejection::new(
                RejectionReason::SyntaxError,
                format!("Python grammar unavailable: {}", e),
            )
        })?;

        let source = source_code.as_bytes();
        let tree = parser.parse(source, None).ok_or_else(|| {
            Rejection::new(RejectionReason::SyntaxError, "failed to parse source")
        })?;

        let root = tree.root_node();
        if root.has_error() {
            let detail = first_error(&root, source)
                .unwrap_or_else(|| "invalid syntax".to_string());
            return Err(Rejection::new(RejectionReason::SyntaxError, detail));
        }

        match find_violation(&root, source) {
            Some(detail) => Err(Rejection::new(RejectionReason::PolicyViolation, detail)),
            None => Ok(()),
        }
    }
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// 深度优先找到第一个错误节点，生成 "line L, column C: ..." 诊断
fn first_error(node: &Node, source: &[u8]) -> Option<String> {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        let message = if node.is_missing() {
            format!("missing '{}'", node.kind())
        } else {
            let snippet = node.utf8_text(source).unwrap_or_default();
            let snippet: String = snippet.lines().next().unwrap_or_default().chars().take(40).collect();
            format!("invalid syntax near '{}'", snippet.trim())
        };
        return Some(format!(
            "line {}, column {}: {}",
            pos.row + 1,
            pos.column + 1,
            message
        ));
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = first_error(&child, source) {
            return Some(found);
        }
    }
    None
}

/// 在语法树上执行禁用策略
fn find_violation(node: &Node, source: &[u8]) -> Option<String> {
    let line = node.start_position().row + 1;

    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for name in node.children_by_field_name("name", &mut cursor) {
                // `import a.b as c` 的 name 字段是 aliased_import
                let module = match name.kind() {
                    "aliased_import" => name.child_by_field_name("name").map(|n| node_text(&n, source)),
                    _ => Some(node_text(&name, source)),
                };
                if let Some(module) = module {
                    if is_forbidden_module(&module) {
                        return Some(format!("line {}: import of '{}' is not allowed", line, module));
                    }
                }
            }
        }
        "import_from_statement" => {
            if let Some(module) = node.child_by_field_name("module_name").map(|n| node_text(&n, source)) {
                if is_forbidden_module(&module) {
                    return Some(format!("line {}: import of '{}' is not allowed", line, module));
                }
                let mut cursor = node.walk();
                for name in node.children_by_field_name("name", &mut cursor) {
                    let imported = match name.kind() {
                        "aliased_import" => name.child_by_field_name("name").map(|n| node_text(&n, source)),
                        _ => Some(node_text(&name, source)),
                    };
                    if let Some(imported) = imported {
                        let qualified = format!("{}.{}", module, imported);
                        if is_forbidden_call(&qualified) {
                            return Some(format!(
                                "line {}: import of '{}' is not allowed",
                                line, qualified
                            ));
                        }
                    }
                }
            }
        }
        "call" => {
            if let Some(function) = node.child_by_field_name("function") {
                let name: String = node_text(&function, source).split_whitespace().collect();
                if is_forbidden_call(&name) {
                    return Some(format!("line {}: call to '{}' is not allowed", line, name));
                }
            }
        }
        "string_content" => {
            let literal = node_text(node, source);
            if let Some(path) = FORBIDDEN_PATHS.iter().find(|p| literal.contains(*p)) {
                return Some(format!(
                    "line {}: string literal references forbidden path '{}'",
                    line, path
                ));
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = find_violation(&child, source) {
            return Some(found);
        }
    }
    None
}

fn node_text(node: &Node, source: &[u8]) -> String {
    node.utf8_text(source).unwrap_or_default().to_string()
}

fn is_forbidden_module(module: &str) -> bool {
    let root = module.split('.').next().unwrap_or(module);
    FORBIDDEN_MODULES.contains(&root)
}

fn is_forbidden_call(name: &str) -> bool {
    FORBIDDEN_BUILTINS.contains(&name)
        || FORBIDDEN_CALLS.contains(&name)
        || FORBIDDEN_CALL_PREFIXES.iter().any(|p| name.starts_with(p))
}
