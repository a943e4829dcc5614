//! Language configuration for compilation and execution
//!
//! The toolchain table is plain data (`files/languages.toml`), parsed once at
//! startup into a [`LanguageTable`]. Resolution is a pure lookup: a language
//! tag (or alias) first, the file extension second.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;
use thiserror::Error;

/// Built-in toolchain table, embedded at compile time
const BUILTIN_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language name (e.g., "cpp")
    pub name: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<String>,
    /// Run command template
    pub run_command: String,
    /// File extensions handled by this toolchain, lower case, without the dot
    pub extensions: Vec<String>,
    /// Alternative tags accepted for this language
    pub aliases: Vec<String>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// A resolved toolchain invocation for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainCommand {
    /// Canonical language name the request resolved to
    pub language: String,
    /// Program that does the work, used in diagnostics ("g++", "python3", ...)
    pub toolchain: String,
    /// Shell command run before `run_step`, if the language is compiled
    pub compile_step: Option<String>,
    /// Shell command whose output is reported
    pub run_step: String,
}

impl ToolchainCommand {
    pub fn is_compiled(&self) -> bool {
        self.compile_step.is_some()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No local toolchain for language '{language}' (file: {file_name})")]
    UnsupportedLanguage { language: String, file_name: String },
}

/// Lookup table from language tags and extensions to toolchains
#[derive(Debug, Clone)]
pub struct LanguageTable {
    languages: Vec<LanguageConfig>,
    by_tag: HashMap<String, usize>,
    by_extension: HashMap<String, usize>,
}

impl LanguageTable {
    /// Table shipped with the binary
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_LANGUAGES).context("Invalid built-in language table")
    }

    /// Load a replacement table from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut names: Vec<&String> = raw_configs.keys().collect();
        names.sort();

        let mut table = Self {
            languages: Vec::with_capacity(names.len()),
            by_tag: HashMap::new(),
            by_extension: HashMap::new(),
        };

        for name in names {
            let raw = &raw_configs[name];
            if raw.run_command.trim().is_empty() {
                bail!("Empty run_command for {}", name);
            }
            if matches!(&raw.compile_command, Some(cmd) if cmd.trim().is_empty()) {
                bail!("Empty compile_command for {}", name);
            }

            let index = table.languages.len();
            let name = name.to_lowercase();

            // Main language name, then aliases
            for tag in std::iter::once(&name).chain(raw.aliases.iter()) {
                let tag = tag.to_lowercase();
                if let Some(previous) = table.by_tag.insert(tag.clone(), index) {
                    bail!(
                        "Language tag '{}' is claimed by both {} and {}",
                        tag,
                        table.languages[previous].name,
                        name
                    );
                }
            }

            let extensions: Vec<String> = raw
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect();
            for ext in &extensions {
                if let Some(previous) = table.by_extension.insert(ext.clone(), index) {
                    bail!(
                        "Extension '{}' is claimed by both {} and {}",
                        ext,
                        table.languages[previous].name,
                        name
                    );
                }
            }

            table.languages.push(LanguageConfig {
                name,
                compile_command: raw.compile_command.clone(),
                run_command: raw.run_command.clone(),
                extensions,
                aliases: raw.aliases.iter().map(|a| a.to_lowercase()).collect(),
            });
        }

        Ok(table)
    }

    /// Get language configuration by language tag or alias
    pub fn get(&self, language: &str) -> Option<&LanguageConfig> {
        let index = self.by_tag.get(&language.trim().to_lowercase())?;
        Some(&self.languages[*index])
    }

    /// Get language configuration from a file name's extension
    pub fn detect(&self, file_name: &str) -> Option<&LanguageConfig> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
        let index = self.by_extension.get(&ext)?;
        Some(&self.languages[*index])
    }

    /// Get all canonical language names, sorted
    pub fn supported_languages(&self) -> Vec<String> {
        self.languages.iter().map(|l| l.name.clone()).collect()
    }

    /// Every configured language, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.languages.iter()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    /// Resolve a language tag and file name to the commands that run it
    pub fn resolve(
        &self,
        language: &str,
        file_name: &str,
    ) -> Result<ToolchainCommand, ResolveError> {
        let config = self
            .get(language)
            .or_else(|| self.detect(file_name))
            .ok_or_else(|| ResolveError::UnsupportedLanguage {
                language: language.trim().to_string(),
                file_name: file_name.to_string(),
            })?;

        let file = shell_quote(file_name);
        let stem = shell_quote(file_stem(file_name));
        let render = |template: &str| template.replace("{file}", &file).replace("{stem}", &stem);

        let compile_step = config.compile_command.as_deref().map(render);
        let run_step = render(&config.run_command);
        let toolchain = program_name(compile_step.as_deref().unwrap_or(&run_step));

        Ok(ToolchainCommand {
            language: config.name.clone(),
            toolchain,
            compile_step,
            run_step,
        })
    }
}

/// File name without its last extension ("Main.java" -> "Main")
pub fn file_stem(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    }
}

/// Quote a word for `sh`, leaving plain words untouched
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+' | ',' | '@' | '%' | ':' | '='));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn program_name(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or(command);
    first.trim_matches(|c| c == '"' || c == '\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LanguageTable {
        LanguageTable::builtin().unwrap()
    }

    #[test]
    fn test_builtin_table_loads() {
        let table = table();
        assert_eq!(
            table.supported_languages(),
            vec![
                "bash",
                "c",
                "cpp",
                "go",
                "java",
                "javascript",
                "lua",
                "perl",
                "php",
                "python",
                "ruby",
                "rust",
                "typescript"
            ]
        );
    }

    #[test]
    fn test_every_tag_and_alias_resolves_to_a_run_step() {
        let table = table();
        for config in &table.languages {
            for tag in std::iter::once(&config.name).chain(config.aliases.iter()) {
                let cmd = table.resolve(tag, "unknown.zzz").unwrap();
                assert_eq!(cmd.language, config.name, "tag {}", tag);
                assert!(!cmd.run_step.trim().is_empty(), "tag {}", tag);
                assert!(!cmd.toolchain.is_empty(), "tag {}", tag);
            }
        }
    }

    #[test]
    fn test_every_extension_resolves_without_a_tag() {
        let table = table();
        for config in &table.languages {
            for ext in &config.extensions {
                let cmd = table.resolve("", &format!("main.{}", ext)).unwrap();
                assert_eq!(cmd.language, config.name, "extension {}", ext);
            }
        }
    }

    #[test]
    fn test_resolution_table() {
        let table = table();
        let cases: &[(&str, &str, Option<&str>, &str)] = &[
            ("python", "main.py", None, "python3 main.py"),
            ("javascript", "bot.js", None, "node bot.js"),
            ("typescript", "app.ts", None, "deno run app.ts"),
            ("php", "index.php", None, "php index.php"),
            ("ruby", "app.rb", None, "ruby app.rb"),
            ("go", "main.go", None, "go run main.go"),
            (
                "c",
                "a.c",
                Some(r#"gcc a.c -o "$BUILD_DIR"/a"#),
                r#""$BUILD_DIR"/a"#,
            ),
            (
                "cpp",
                "a.cpp",
                Some(r#"g++ a.cpp -o "$BUILD_DIR"/a"#),
                r#""$BUILD_DIR"/a"#,
            ),
            (
                "rust",
                "main.rs",
                Some(r#"rustc main.rs -o "$BUILD_DIR"/main"#),
                r#""$BUILD_DIR"/main"#,
            ),
            (
                "java",
                "HubPlugin.java",
                Some(r#"javac -d "$BUILD_DIR" HubPlugin.java"#),
                r#"java -cp "$BUILD_DIR" HubPlugin"#,
            ),
        ];

        for (language, file, compile, run) in cases {
            let cmd = table.resolve(language, file).unwrap();
            assert_eq!(cmd.compile_step.as_deref(), *compile, "{}", language);
            assert_eq!(cmd.run_step, *run, "{}", language);
        }
    }

    #[test]
    fn test_toolchain_names() {
        let table = table();
        assert_eq!(table.resolve("cpp", "a.cpp").unwrap().toolchain, "g++");
        assert_eq!(table.resolve("java", "A.java").unwrap().toolchain, "javac");
        assert_eq!(table.resolve("python", "a.py").unwrap().toolchain, "python3");
    }

    #[test]
    fn test_go_runs_without_compile_step() {
        let cmd = table().resolve("golang", "main.go").unwrap();
        assert!(!cmd.is_compiled());
    }

    #[test]
    fn test_language_is_case_insensitive() {
        let table = table();
        assert_eq!(table.resolve("  PYTHON ", "x.txt").unwrap().language, "python");
        assert_eq!(table.resolve("C++", "x.txt").unwrap().language, "cpp");
    }

    #[test]
    fn test_tag_wins_over_extension() {
        let cmd = table().resolve("ruby", "main.py").unwrap();
        assert_eq!(cmd.language, "ruby");
    }

    #[test]
    fn test_unknown_tag_falls_back_to_extension() {
        let cmd = table().resolve("plaintext", "Main.PY").unwrap();
        assert_eq!(cmd.language, "python");
    }

    #[test]
    fn test_unsupported_language() {
        let err = table().resolve("cobol", "main.cob").unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnsupportedLanguage {
                language: "cobol".into(),
                file_name: "main.cob".into()
            }
        );
        assert!(err.to_string().contains("cobol"));
        assert!(table().resolve("", "Makefile").is_err());
    }

    #[test]
    fn test_file_names_are_quoted() {
        let cmd = table().resolve("python", "my script's.py").unwrap();
        assert_eq!(cmd.run_step, r"python3 'my script'\''s.py'");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("Main.java"), "Main");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(file_stem("Makefile"), "Makefile");
        assert_eq!(file_stem(".bashrc"), ".bashrc");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("main.py"), "main.py");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(rm)"), "'$(rm)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_load_languages_from_toml() {
        let table = LanguageTable::from_toml_str(
            r#"
[c]
compile_command = "gcc -o main main.c"
run_command = "./main"
extensions = ["c"]

[python]
run_command = "python3 {file}"
extensions = [".py"]
aliases = ["py", "Python3"]
"#,
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("python3").unwrap().name, "python");
        assert_eq!(table.detect("x.py").unwrap().name, "python");
        assert!(table.get("c").unwrap().compile_command.is_some());

        let listed: Vec<_> = table
            .iter()
            .map(|l| (l.name.as_str(), l.extensions.clone(), l.aliases.clone()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("c", vec!["c".to_string()], vec![]),
                (
                    "python",
                    vec!["py".to_string()],
                    vec!["py".to_string(), "python3".to_string()]
                ),
            ]
        );
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let result = LanguageTable::from_toml_str(
            r#"
[python]
run_command = "python3 {file}"
aliases = ["py"]

[pypy]
run_command = "pypy {file}"
aliases = ["py"]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_run_command_is_rejected() {
        assert!(LanguageTable::from_toml_str("[x]\nrun_command = \"  \"\n").is_err());
    }
}
