// JavaScript family: typescript, javascript, node, react and vue all run
// under Vitest with the JSON and verbose reporters.

use super::{extract_error_with, keep_all, Capture, Fallback, LanguageExecutor, RunMode};
use crate::parsers::parse_vitest_output;
use crate::sandbox::{Layout, SandboxCommand};
use crate::workspace::FileSet;
use blankcode_common::types::{ExecutionContext, TestResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

lazy_static! {
    static ref TOP_LEVEL_DECL: Regex = Regex::new(
        r"(?m)^(export\s+)?(?:declare\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|enum)\s+([A-Za-z_$][\w$]*)"
    )
    .unwrap();
    static ref HAS_EXPORT: Regex = Regex::new(r"(?m)^\s*export\s").unwrap();
    static ref ERROR_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)error TS\d+: (.+)").unwrap(),
        Regex::new(r"(?i)SyntaxError: (.+)").unwrap(),
        Regex::new(r"(?i)TypeError: (.+)").unwrap(),
        Regex::new(r"(?i)ReferenceError: (.+)").unwrap(),
        Regex::new(r"(?i)Error: (.+)").unwrap(),
    ];
}

const VITEST_SCRIPT: &str = "vitest run --reporter=json --reporter=verbose";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsFlavor {
    TypeScript,
    JavaScript,
    Node,
    React,
    Vue,
}

impl JsFlavor {
    fn typed(self) -> bool {
        matches!(self, JsFlavor::TypeScript | JsFlavor::React | JsFlavor::Vue)
    }

    fn solution_file(self) -> &'static str {
        match self {
            JsFlavor::TypeScript => "solution.ts",
            JsFlavor::JavaScript | JsFlavor::Node => "solution.js",
            JsFlavor::React => "solution.tsx",
            JsFlavor::Vue => "Solution.vue",
        }
    }

    fn test_file(self) -> &'static str {
        match self {
            JsFlavor::TypeScript | JsFlavor::Vue => "solution.test.ts",
            JsFlavor::JavaScript | JsFlavor::Node => "solution.test.js",
            JsFlavor::React => "solution.test.tsx",
        }
    }

    fn config_file(self) -> &'static str {
        if self.typed() {
            "vitest.config.ts"
        } else {
            "vitest.config.js"
        }
    }

    fn environment(self) -> &'static str {
        match self {
            JsFlavor::React | JsFlavor::Vue => "jsdom",
            _ => "node",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JavaScriptExecutor {
    flavor: JsFlavor,
}

impl JavaScriptExecutor {
    pub const fn new(flavor: JsFlavor) -> Self {
        Self { flavor }
    }

    pub fn flavor(&self) -> JsFlavor {
        self.flavor
    }

    fn package_json(&self) -> String {
        let mut dev = serde_json::Map::new();
        dev.insert("vitest".into(), json!("^2.0.0"));
        if self.flavor.typed() {
            dev.insert("typescript".into(), json!("^5.0.0"));
        }
        match self.flavor {
            JsFlavor::React => {
                dev.insert("react".into(), json!("^18.3.0"));
                dev.insert("react-dom".into(), json!("^18.3.0"));
                dev.insert("@types/react".into(), json!("^18.3.0"));
                dev.insert("@testing-library/react".into(), json!("^16.0.0"));
                dev.insert("@vitejs/plugin-react".into(), json!("^4.3.0"));
                dev.insert("jsdom".into(), json!("^24.0.0"));
            }
            JsFlavor::Vue => {
                dev.insert("vue".into(), json!("^3.4.0"));
                dev.insert("@vue/test-utils".into(), json!("^2.4.0"));
                dev.insert("@vitejs/plugin-vue".into(), json!("^5.0.0"));
                dev.insert("jsdom".into(), json!("^24.0.0"));
            }
            _ => {}
        }

        let manifest = json!({
            "name": "blankcode-runner",
            "private": true,
            "type": "module",
            "scripts": { "test": VITEST_SCRIPT },
            "devDependencies": dev,
        });
        serde_json::to_string_pretty(&manifest).unwrap_or_default()
    }

    fn vitest_config(&self) -> String {
        let (plugin_import, plugins) = match self.flavor {
            JsFlavor::React => ("import react from '@vitejs/plugin-react'\n", "[react()]"),
            JsFlavor::Vue => ("import vue from '@vitejs/plugin-vue'\n", "[vue()]"),
            _ => ("", "[]"),
        };
        format!(
            r#"import {{ defineConfig }} from 'vitest/config'
{plugin_import}
export default defineConfig({{
  plugins: {plugins},
  cacheDir: process.env.VITEST_CACHE_DIR || 'node_modules/.vite',
  test: {{
    include: ['{test_file}'],
    environment: '{environment}',
    globals: true,
    watch: false,
  }},
}})
"#,
            plugin_import = plugin_import,
            plugins = plugins,
            test_file = self.flavor.test_file(),
            environment = self.flavor.environment(),
        )
    }

    fn tsconfig(&self) -> String {
        let mut options = json!({
            "target": "ES2022",
            "module": "ESNext",
            "moduleResolution": "bundler",
            "strict": true,
            "esModuleInterop": true,
            "skipLibCheck": true,
            "types": ["vitest/globals"],
        });
        if self.flavor == JsFlavor::React {
            options["jsx"] = json!("react-jsx");
        }
        serde_json::to_string_pretty(&json!({ "compilerOptions": options })).unwrap_or_default()
    }
}

/// Names of top-level value declarations, in order, deduplicated.
fn declared_names(code: &str, exported_only: bool) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TOP_LEVEL_DECL.captures_iter(code) {
        if exported_only && caps.get(1).is_none() {
            continue;
        }
        let name = caps[2].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Export every top-level binding when the submission exports nothing, so
/// the hidden tests can import it.
pub fn auto_export(code: &str) -> String {
    if HAS_EXPORT.is_match(code) {
        return code.to_string();
    }
    let names = declared_names(code, false);
    if names.is_empty() {
        return code.to_string();
    }
    format!("{}\n\nexport {{ {} }}\n", code.trim_end(), names.join(", "))
}

fn references_solution(test_code: &str) -> bool {
    test_code.contains("./solution") || test_code.contains("./Solution")
}

/// Import the submission into the test file unless it already does.
pub fn auto_import(flavor: JsFlavor, code: &str, test_code: &str) -> String {
    if references_solution(test_code) {
        return test_code.to_string();
    }
    if flavor == JsFlavor::Vue {
        return format!("import Solution from './Solution.vue'\n\n{}", test_code);
    }

    let exported_only = HAS_EXPORT.is_match(code);
    let names = declared_names(code, exported_only);
    if names.is_empty() {
        return format!("import * as solution from './solution'\n\n{}", test_code);
    }
    format!(
        "import {{ {} }} from './solution'\n\n{}",
        names.join(", "),
        test_code
    )
}

impl LanguageExecutor for JavaScriptExecutor {
    fn name(&self) -> &'static str {
        match self.flavor {
            JsFlavor::TypeScript => "typescript",
            JsFlavor::JavaScript => "javascript",
            JsFlavor::Node => "node",
            JsFlavor::React => "react",
            JsFlavor::Vue => "vue",
        }
    }

    fn files(&self, ctx: &ExecutionContext, _mode: RunMode) -> FileSet {
        let code = if self.flavor == JsFlavor::Vue {
            ctx.code.clone()
        } else {
            auto_export(&ctx.code)
        };

        let mut files = FileSet::new();
        files.insert(self.flavor.solution_file().to_string(), code);
        files.insert(
            self.flavor.test_file().to_string(),
            auto_import(self.flavor, &ctx.code, &ctx.test_code),
        );
        files.insert("package.json".to_string(), self.package_json());
        files.insert(self.flavor.config_file().to_string(), self.vitest_config());
        if self.flavor.typed() {
            files.insert("tsconfig.json".to_string(), self.tsconfig());
        }
        files
    }

    fn command(&self, _mode: RunMode, layout: &Layout) -> SandboxCommand {
        SandboxCommand::new(["npm", "test"])
            .env("NODE_ENV", "test")
            .env("CI", "true")
            .env("NO_COLOR", "1")
            .env("FORCE_COLOR", "0")
            .env("HOME", layout.scratch_str())
            .env("npm_config_cache", layout.scratch_path(".npm"))
            .env("npm_config_update_notifier", "false")
            .env("VITEST_CACHE_DIR", layout.scratch_path(".vite"))
    }

    fn setup(&self, layout: &Layout) -> Option<SandboxCommand> {
        Some(
            SandboxCommand::new(["npm", "install", "--silent", "--no-audit", "--no-fund"])
                .env("HOME", layout.scratch_str())
                .env("npm_config_cache", layout.scratch_path(".npm")),
        )
    }

    fn parse(&self, output: &str) -> Vec<TestResult> {
        parse_vitest_output(output)
    }

    fn extract_error(&self, output: &str) -> String {
        extract_error_with(&ERROR_PATTERNS, Capture::FirstGroup, output, keep_all, Fallback::Last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::context;
    use blankcode_common::types::Language;
    use std::path::PathBuf;

    fn layout() -> Layout {
        Layout {
            workdir: PathBuf::from("/app"),
            scratch: PathBuf::from("/tmp"),
            isolated: true,
        }
    }

    #[test]
    fn test_auto_export_adds_export_list() {
        let code = "function add(a, b) { return a + b }\nconst PI = 3.14\nasync function load() {}\nclass Stack {}\n";
        let out = auto_export(code);
        assert!(out.ends_with("export { add, PI, load, Stack }\n"));
    }

    #[test]
    fn test_auto_export_leaves_exporting_code_alone() {
        let code = "export function add(a: number, b: number) { return a + b }\n";
        assert_eq!(auto_export(code), code);
    }

    #[test]
    fn test_auto_export_ignores_nested_declarations() {
        let code = "function outer() {\n  const inner = 1\n  return inner\n}\n";
        assert!(auto_export(code).ends_with("export { outer }\n"));
    }

    #[test]
    fn test_auto_import() {
        let test = "test('adds', () => expect(add(1, 2)).toBe(3))";
        let out = auto_import(JsFlavor::TypeScript, "function add() {}", test);
        assert!(out.starts_with("import { add } from './solution'\n"));

        let already = "import { add } from './solution'\ntest('x', () => {})";
        assert_eq!(auto_import(JsFlavor::TypeScript, "function add() {}", already), already);

        let out = auto_import(JsFlavor::TypeScript, "export function add() {}\nfunction helper() {}", test);
        assert!(out.starts_with("import { add } from './solution'"));

        let out = auto_import(JsFlavor::Vue, "<template><div/></template>", "test('x', () => {})");
        assert!(out.starts_with("import Solution from './Solution.vue'"));
    }

    #[test]
    fn test_typescript_files() {
        let executor = JavaScriptExecutor::new(JsFlavor::TypeScript);
        let ctx = context(Language::Typescript, "function add(a: number, b: number) { return a + b }", "test('a', () => {})");
        let files = executor.files(&ctx, RunMode::Test);

        let names: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["package.json", "solution.test.ts", "solution.ts", "tsconfig.json", "vitest.config.ts"]
        );
        let manifest: serde_json::Value = serde_json::from_str(&files["package.json"]).unwrap();
        assert_eq!(manifest["scripts"]["test"], VITEST_SCRIPT);
        assert!(manifest["devDependencies"]["typescript"].is_string());
        assert!(files["vitest.config.ts"].contains("environment: 'node'"));
        // The persisted submission text is not touched.
        assert!(!ctx.code.contains("export"));
    }

    #[test]
    fn test_react_and_vue_files() {
        let react = JavaScriptExecutor::new(JsFlavor::React);
        let files = react.files(&context(Language::React, "function App() { return <div/> }", "test('x', () => {})"), RunMode::Test);
        assert!(files.contains_key("solution.tsx"));
        assert!(files["vitest.config.ts"].contains("environment: 'jsdom'"));
        assert!(files["tsconfig.json"].contains("react-jsx"));

        let vue = JavaScriptExecutor::new(JsFlavor::Vue);
        let sfc = "<template><p>{{ msg }}</p></template>";
        let files = vue.files(&context(Language::Vue, sfc, "test('x', () => {})"), RunMode::Test);
        assert_eq!(files["Solution.vue"], sfc);
        assert!(files["vitest.config.ts"].contains("plugin-vue"));
    }

    #[test]
    fn test_command_redirects_caches() {
        let executor = JavaScriptExecutor::new(JsFlavor::JavaScript);
        let command = executor.command(RunMode::Test, &layout());
        assert_eq!(command.argv, vec!["npm", "test"]);
        assert!(command
            .env
            .contains(&("VITEST_CACHE_DIR".to_string(), "/tmp/.vite".to_string())));
        assert!(command.env.contains(&("HOME".to_string(), "/tmp".to_string())));
    }

    #[test]
    fn test_extract_error() {
        let executor = JavaScriptExecutor::new(JsFlavor::TypeScript);
        assert_eq!(
            executor.extract_error("solution.ts(1,7): error TS2322: Type 'string' is not assignable to type 'number'."),
            "Type 'string' is not assignable to type 'number'."
        );
        assert_eq!(
            executor.extract_error("SyntaxError: Unexpected token '}'\n    at foo"),
            "Unexpected token '}'"
        );
        assert_eq!(executor.extract_error("weird\nfailure"), "weird\nfailure");
    }
}
