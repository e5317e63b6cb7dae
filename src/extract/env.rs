use once_cell::sync::Lazy;
use regex::Regex;

use super::{fragment, Extractor};
use crate::models::{ArtifactKind, Fragment, FragmentKind, RepositoryArtifact};

/// Accessor calls recognized in any language. Group 1 is the variable name.
static ACCESSORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Rust
        r#"\b(?:env::var(?:_os)?|option_env!|env!)\s*\(\s*"([A-Za-z_][A-Za-z0-9_]*)""#,
        // Python
        r#"\bos\.(?:getenv\(|environ\.get\(|environ\[)\s*['"]([A-Za-z_][A-Za-z0-9_]*)['"]"#,
        // JavaScript / TypeScript
        r#"\bprocess\.env\.([A-Za-z_][A-Za-z0-9_]*)"#,
        r#"\bprocess\.env\[\s*['"]([A-Za-z_][A-Za-z0-9_]*)['"]"#,
        // Go
        r#"\bos\.(?:Getenv|LookupEnv)\(\s*"([A-Za-z_][A-Za-z0-9_]*)""#,
        // Java / Kotlin
        r#"\bSystem\.getenv\(\s*"([A-Za-z_][A-Za-z0-9_]*)""#,
        // Ruby
        r#"\bENV(?:\.fetch\(|\[)\s*['"]([A-Za-z_][A-Za-z0-9_]*)['"]"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid regex"))
    .collect()
});

static INTERPOLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:[:?\-+][^}]*)?\}").expect("Invalid regex")
});

static DOTENV_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=").expect("Invalid regex")
});

/// Finds environment variable references. Produces annotations only.
pub struct EnvVarExtractor;

impl Extractor for EnvVarExtractor {
    fn name(&self) -> &'static str {
        "env_var"
    }

    fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment> {
        let lines: Vec<&str> = artifact.content.lines().collect();
        let interpolates =
            artifact.kind == ArtifactKind::Config || artifact.language == "shell";
        let dotenv = artifact.language == "dotenv";

        let mut out = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let mut names: Vec<&str> = Vec::new();
            if dotenv {
                if line.trim_start().starts_with('#') {
                    continue;
                }
                if let Some(caps) = DOTENV_ASSIGNMENT.captures(line) {
                    names.extend(caps.get(1).map(|m| m.as_str()));
                }
            }
            for re in ACCESSORS.iter() {
                names.extend(re.captures_iter(line).filter_map(|c| c.get(1)).map(|m| m.as_str()));
            }
            if interpolates {
                names.extend(
                    INTERPOLATION
                        .captures_iter(line)
                        .filter_map(|c| c.get(1))
                        .map(|m| m.as_str()),
                );
            }

            let mut seen: Vec<&str> = Vec::with_capacity(names.len());
            for name in names {
                if seen.contains(&name) {
                    continue;
                }
                seen.push(name);
                out.push(fragment(
                    FragmentKind::EnvVar,
                    &lines,
                    i,
                    i,
                    Some(name.to_string()),
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::test_support::artifact;

    fn names(a: &RepositoryArtifact) -> Vec<(usize, String)> {
        EnvVarExtractor
            .extract(a)
            .into_iter()
            .map(|f| (f.start_line, f.symbol.unwrap_or_default()))
            .collect()
    }

    #[test]
    fn test_rust_and_python_accessors() {
        let rs = artifact(
            "src/main.rs",
            "fn main() {\n    let url = std::env::var(\"DATABASE_URL\").unwrap();\n    let v = env!(\"CARGO_PKG_VERSION\");\n}\n",
        );
        assert_eq!(
            names(&rs),
            vec![(2, "DATABASE_URL".into()), (3, "CARGO_PKG_VERSION".into())]
        );

        let py = artifact(
            "app.py",
            "key = os.environ['API_KEY']\nhost = os.getenv(\"HOST\", 'x') or os.environ.get('HOST')\n",
        );
        assert_eq!(names(&py), vec![(1, "API_KEY".into()), (2, "HOST".into())]);
    }

    #[test]
    fn test_js_go_java_ruby() {
        let js = artifact("index.js", "const port = process.env.PORT || 3000;\n");
        assert_eq!(names(&js), vec![(1, "PORT".into())]);
        let go = artifact("main.go", "addr := os.Getenv(\"ADDR\")\n");
        assert_eq!(names(&go), vec![(1, "ADDR".into())]);
        let java = artifact("App.java", "String t = System.getenv(\"TOKEN\");\n");
        assert_eq!(names(&java), vec![(1, "TOKEN".into())]);
        let rb = artifact("app.rb", "secret = ENV['SECRET_KEY']\n");
        assert_eq!(names(&rb), vec![(1, "SECRET_KEY".into())]);
    }

    #[test]
    fn test_config_interpolation_and_dotenv() {
        let yaml = artifact("deploy.yaml", "image: app:${TAG:-latest}\nhost: ${DB_HOST}\n");
        assert_eq!(names(&yaml), vec![(1, "TAG".into()), (2, "DB_HOST".into())]);

        let js = artifact("view.js", "const s = `${user}`;\n");
        assert!(names(&js).is_empty());

        let env = artifact(".env", "# comment\nexport REDIS_URL=redis://x\nLOG_LEVEL=debug\n");
        assert_eq!(names(&env), vec![(2, "REDIS_URL".into()), (3, "LOG_LEVEL".into())]);
    }

    #[test]
    fn test_annotations_are_single_line() {
        let rs = artifact("src/lib.rs", "let a = env::var(\"A\");\n");
        let frags = EnvVarExtractor.extract(&rs);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].kind, FragmentKind::EnvVar);
        assert_eq!(frags[0].start_line, frags[0].end_line);
    }
}
