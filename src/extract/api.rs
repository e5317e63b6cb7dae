use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::{partition, Extractor};
use crate::models::{Fragment, FragmentKind, RepositoryArtifact};

/// How the `name` capture of a definition pattern becomes a symbol.
#[derive(Clone, Copy)]
enum NameStyle {
    Plain,
    /// `impl<T> Trait for path::Type<T>` names the implementing type.
    RustImpl,
}

struct Definition {
    regex: Regex,
    style: NameStyle,
}

struct LanguageRules {
    definitions: Vec<Definition>,
    /// `#` starts a comment (rather than an attribute or preprocessor line).
    hash_comments: bool,
}

fn rules(patterns: &[&str], hash_comments: bool) -> LanguageRules {
    LanguageRules {
        definitions: patterns
            .iter()
            .map(|p| Definition {
                regex: Regex::new(p).expect("Invalid regex"),
                style: NameStyle::Plain,
            })
            .collect(),
        hash_comments,
    }
}

const JS_PATTERNS: &[&str] = &[
    r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\b\s*\*?\s*(?P<name>[A-Za-z_$][\w$]*)",
    r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)",
    r"^\s*(?:export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?::[^=]*)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]*)?=>",
];

const C_PATTERNS: &[&str] = &[
    r"^(?:(?:static|inline|extern|const|unsigned|signed|struct|enum)\s+)*[A-Za-z_]\w*[\s*&]+(?P<name>[A-Za-z_]\w*)\s*\([^;]*$",
    r"^(?:typedef\s+)?(?:struct|enum|union)\s+(?P<name>[A-Za-z_]\w*)\s*\{?\s*$",
];

const CPP_PATTERNS: &[&str] = &[
    r"^(?:(?:static|inline|extern|const|virtual|constexpr|unsigned|signed)\s+)*[A-Za-z_][\w:<>,]*[\s*&]+(?P<name>[A-Za-z_~][\w:~]*)\s*\([^;]*$",
    r"^(?:template\s*<[^>]*>\s*)?(?:class|struct|namespace|union|enum(?:\s+class)?)\s+(?P<name>[A-Za-z_]\w*)[^;]*$",
];

static LANGUAGES: Lazy<HashMap<&'static str, LanguageRules>> = Lazy::new(|| {
    let mut map = HashMap::new();

    let mut rust = rules(
        &[
            r"^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:(?:const|async|unsafe|default)\s+)*(?:extern\s+(?:\x22[^\x22]*\x22\s+)?)?fn\s+(?P<name>[A-Za-z_]\w*)",
            r"^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:unsafe\s+)?(?:struct|enum|trait|union|type|mod)\s+(?P<name>[A-Za-z_]\w*)",
            r"^\s*macro_rules!\s*(?P<name>[A-Za-z_]\w*)",
        ],
        false,
    );
    rust.definitions.push(Definition {
        regex: Regex::new(r"^\s*(?:unsafe\s+)?impl\b(?P<name>.*)$").expect("Invalid regex"),
        style: NameStyle::RustImpl,
    });
    map.insert("rust", rust);

    map.insert(
        "python",
        rules(
            &[
                r"^\s*(?:async\s+)?def\s+(?P<name>[A-Za-z_]\w*)",
                r"^\s*class\s+(?P<name>[A-Za-z_]\w*)",
            ],
            true,
        ),
    );

    map.insert("javascript", rules(JS_PATTERNS, false));
    let mut ts = rules(JS_PATTERNS, false);
    ts.definitions.push(Definition {
        regex: Regex::new(
            r"^\s*(?:export\s+)?(?:declare\s+)?(?:interface|type|enum)\s+(?P<name>[A-Za-z_$][\w$]*)",
        )
        .expect("Invalid regex"),
        style: NameStyle::Plain,
    });
    map.insert("typescript", ts);

    map.insert(
        "go",
        rules(
            &[
                r"^func\s+(?:\([^)]*\)\s*)?(?P<name>[A-Za-z_]\w*)",
                r"^type\s+(?P<name>[A-Za-z_]\w*)",
            ],
            false,
        ),
    );

    map.insert(
        "java",
        rules(
            &[
                r"^\s*(?:(?:public|private|protected|static|final|abstract|sealed|strictfp)\s+)*(?:class|interface|enum|record|@interface)\s+(?P<name>\w+)",
                r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|native|default)\s+)+(?:<[^>]*>\s+)?[\w<>\[\],.?]+\s+(?P<name>\w+)\s*\(",
            ],
            false,
        ),
    );

    map.insert(
        "csharp",
        rules(
            &[
                r"^\s*(?:(?:public|private|protected|internal|static|sealed|abstract|partial|readonly)\s+)*(?:class|interface|enum|struct|record)\s+(?P<name>\w+)",
                r"^\s*(?:(?:public|private|protected|internal|static|virtual|override|abstract|async|sealed|extern)\s+)+[\w<>\[\],.?]+\s+(?P<name>\w+)\s*[(<]",
            ],
            false,
        ),
    );

    map.insert(
        "kotlin",
        rules(
            &[
                r"^\s*(?:(?:public|private|protected|internal|open|abstract|sealed|data|enum|inner|annotation)\s+)*(?:class|interface|object)\s+(?P<name>\w+)",
                r"^\s*(?:(?:public|private|protected|internal|open|override|suspend|inline|operator|infix)\s+)*fun\s+(?:<[^>]*>\s*)?(?:[\w.]+\.)?(?P<name>\w+)\s*\(",
            ],
            false,
        ),
    );

    map.insert("c", rules(C_PATTERNS, false));
    map.insert("cpp", rules(CPP_PATTERNS, false));

    map.insert(
        "ruby",
        rules(
            &[
                r"^\s*def\s+(?:self\.)?(?P<name>[A-Za-z_]\w*[?!=]?)",
                r"^\s*(?:class|module)\s+(?P<name>[A-Z][\w:]*)",
            ],
            true,
        ),
    );

    map.insert(
        "shell",
        rules(
            &[
                r"^\s*function\s+(?P<name>[A-Za-z_][\w-]*)",
                r"^\s*(?P<name>[A-Za-z_][\w-]*)\s*\(\)\s*\{?",
            ],
            true,
        ),
    );

    map.insert(
        "swift",
        rules(
            &[r"^\s*(?:(?:public|private|internal|fileprivate|open|static|final|override|mutating|@\w+)\s+)*(?:func|class|struct|enum|protocol|extension)\s+(?P<name>\w+)"],
            false,
        ),
    );

    map.insert(
        "php",
        rules(
            &[
                r"^\s*(?:(?:public|private|protected|static|abstract|final)\s+)*function\s+(?P<name>\w+)",
                r"^\s*(?:(?:abstract|final)\s+)?(?:class|interface|trait)\s+(?P<name>\w+)",
            ],
            false,
        ),
    );

    map.insert(
        "scala",
        rules(
            &[r"^\s*(?:(?:private|protected|override|final|implicit|sealed|abstract|case|lazy)\s+)*(?:def|class|object|trait)\s+(?P<name>\w+)"],
            false,
        ),
    );

    map
});

const CONTROL_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "case", "return", "sizeof", "new", "delete",
];

/// Recognizes code definitions and cuts the artifact at each of them.
///
/// Each `Symbol` fragment starts at its definition, pulled up over directly
/// preceding doc comments, attributes and decorators, and ends on the line
/// before the next definition. Code before the first definition becomes a
/// `Text` fragment. Languages without rules, and files without any
/// definition, produce nothing.
pub struct ApiSignatureExtractor;

impl Extractor for ApiSignatureExtractor {
    fn name(&self) -> &'static str {
        "api_signature"
    }

    fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment> {
        let Some(rules) = LANGUAGES.get(artifact.language.as_str()) else {
            return Vec::new();
        };
        let lines: Vec<&str> = artifact.content.lines().collect();

        let definitions = find_definitions(rules, &lines);
        if definitions.is_empty() {
            return Vec::new();
        }

        let mut nested = nesting(&lines, &definitions);
        let mut starts: Vec<(usize, Option<String>)> = Vec::with_capacity(definitions.len() + 1);
        let mut floor = 0;
        for (line, name) in definitions {
            let start = pull_up(rules, &lines, line, floor);
            starts.push((start, Some(name)));
            floor = line + 1;
        }

        let first = starts[0].0;
        let has_preamble = first > 0 && !lines[..first].iter().all(|l| l.trim().is_empty());
        if has_preamble {
            starts.insert(0, (0, None));
            nested.insert(0, false);
        } else {
            starts[0].0 = 0;
        }

        let mut fragments = partition(
            |i| {
                if i == 0 && has_preamble {
                    FragmentKind::Text
                } else {
                    FragmentKind::Symbol
                }
            },
            &lines,
            &starts,
        );
        for (fragment, nested) in fragments.iter_mut().zip(nested) {
            fragment.nested = nested;
        }
        fragments
    }
}

/// For each definition, whether it sits inside the body of the closest
/// outer definition before it.
///
/// A definition is nested when it is indented deeper than the open outer
/// definition and no line in between has dropped back to the outer's
/// indentation, other than bracket-only lines and `end`.
fn nesting(lines: &[&str], definitions: &[(usize, String)]) -> Vec<bool> {
    let mut out = Vec::with_capacity(definitions.len());
    let mut outer: Option<(usize, usize)> = None;

    for &(line, _) in definitions {
        let depth = indent(lines[line]);
        let inside = outer.is_some_and(|(outer_line, outer_depth)| {
            depth > outer_depth
                && lines[outer_line + 1..line]
                    .iter()
                    .all(|l| l.trim().is_empty() || indent(l) > outer_depth || is_bracket_line(l))
        });
        if !inside {
            outer = Some((line, depth));
        }
        out.push(inside);
    }
    out
}

fn indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_bracket_line(line: &str) -> bool {
    let t = line.trim();
    t.starts_with(['{', '}', ')', ']']) || t == "end"
}

fn find_definitions(rules: &LanguageRules, lines: &[&str]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        for def in &rules.definitions {
            let Some(caps) = def.regex.captures(line) else {
                continue;
            };
            let raw = caps.name("name").map(|m| m.as_str()).unwrap_or_default();
            let name = match def.style {
                NameStyle::Plain => last_segment(raw).to_string(),
                NameStyle::RustImpl => rust_impl_target(raw),
            };
            if name.is_empty() || CONTROL_KEYWORDS.contains(&name.as_str()) {
                continue;
            }
            out.push((i, name));
            break;
        }
    }
    out
}

/// Move a definition's start up over the comment and attribute lines
/// directly above it, but never to or above `floor`'s predecessor.
fn pull_up(rules: &LanguageRules, lines: &[&str], line: usize, floor: usize) -> usize {
    let mut start = line;
    while start > floor && is_leading_line(rules, lines[start - 1]) {
        start -= 1;
    }
    start
}

fn is_leading_line(rules: &LanguageRules, line: &str) -> bool {
    let t = line.trim_start();
    if t.is_empty() || t.starts_with("//!") {
        return false;
    }
    if t.starts_with("//") || t.starts_with("/*") || t.starts_with('*') || t.starts_with('@') {
        return true;
    }
    if rules.hash_comments {
        t.starts_with('#') && !t.starts_with("#!")
    } else {
        t.starts_with("#[")
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

/// `"<T: Clone> fmt::Display for Wrapper<T> {"` -> `"Wrapper"`.
fn rust_impl_target(rest: &str) -> String {
    let mut s = rest.trim();
    if s.starts_with('<') {
        let mut depth = 0usize;
        let mut cut = s.len();
        for (i, c) in s.char_indices() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        cut = i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        s = s[cut..].trim();
    }
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find(" where") {
        s = &s[..i];
    }
    if let Some((_, target)) = s.split_once(" for ") {
        s = target;
    }
    if let Some(i) = s.find('<') {
        s = &s[..i];
    }
    let s = s.trim().trim_start_matches('&').trim_start_matches("dyn ");
    last_segment(s.trim()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::test_support::{artifact, assert_partition};

    fn symbols(frags: &[Fragment]) -> Vec<Option<&str>> {
        frags.iter().map(|f| f.symbol.as_deref()).collect()
    }

    #[test]
    fn test_rust_definitions_pull_up_docs() {
        let content = "\
use std::fmt;

/// A point.
#[derive(Debug)]
pub struct Point {
    x: i32,
}

impl<T: Clone> fmt::Display for Wrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

// helper
pub(crate) async fn load_config() {}
";
        let a = artifact("src/point.rs", content);
        let frags = ApiSignatureExtractor.extract(&a);
        assert_eq!(
            symbols(&frags),
            vec![None, Some("Point"), Some("Wrapper"), Some("fmt"), Some("load_config")]
        );
        assert_eq!(frags[0].kind, FragmentKind::Text);
        assert_eq!(frags[1].start_line, 3, "doc comment and attribute belong to Point");
        assert!(frags[1].text.starts_with("/// A point."));
        assert_eq!(frags[4].start_line, 15);
        assert!(frags[1..].iter().all(|f| f.kind == FragmentKind::Symbol));
        assert_partition(&frags, 16);
    }

    #[test]
    fn test_python_decorators() {
        let content = "import os\n\n@app.route('/')\ndef index():\n    return 'hi'\n\nclass Service:\n    def run(self):\n        pass\n";
        let a = artifact("app.py", content);
        let frags = ApiSignatureExtractor.extract(&a);
        assert_eq!(
            symbols(&frags),
            vec![None, Some("index"), Some("Service"), Some("run")]
        );
        assert_eq!(frags[1].start_line, 3);
        assert_partition(&frags, 9);
    }

    #[test]
    fn test_nested_definitions_are_marked() {
        let py = artifact(
            "util.py",
            "def a():\n    return 1\n\ndef outer():\n    def inner():\n        return 2\n    return inner()\n\ndef b():\n    pass\n",
        );
        let frags = ApiSignatureExtractor.extract(&py);
        assert_eq!(
            symbols(&frags),
            vec![Some("a"), Some("outer"), Some("inner"), Some("b")]
        );
        let nested: Vec<bool> = frags.iter().map(|f| f.nested).collect();
        assert_eq!(nested, vec![false, false, true, false]);

        let rs = artifact(
            "src/server.rs",
            "impl Server {\n    pub fn start(&self) {\n    }\n\n    fn stop(&self) {}\n}\n\nfn main() {}\n",
        );
        let frags = ApiSignatureExtractor.extract(&rs);
        assert_eq!(
            symbols(&frags),
            vec![Some("Server"), Some("start"), Some("stop"), Some("main")]
        );
        let nested: Vec<bool> = frags.iter().map(|f| f.nested).collect();
        assert_eq!(nested, vec![false, true, true, false]);
    }

    #[test]
    fn test_javascript_arrow_and_go() {
        let js = artifact(
            "web/api.js",
            "export const fetchUser = async (id) => {\n  return id;\n};\nfunction render() {}\n",
        );
        assert_eq!(
            symbols(&ApiSignatureExtractor.extract(&js)),
            vec![Some("fetchUser"), Some("render")]
        );

        let go = artifact(
            "main.go",
            "package main\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n\ntype Server struct{}\n",
        );
        assert_eq!(
            symbols(&ApiSignatureExtractor.extract(&go)),
            vec![None, Some("Start"), Some("Server")]
        );
    }

    #[test]
    fn test_c_skips_control_flow() {
        let c = artifact(
            "main.c",
            "#include <stdio.h>\n\nint main(int argc, char **argv)\n{\n    if (argc) {}\n    return 0;\n}\n",
        );
        let frags = ApiSignatureExtractor.extract(&c);
        assert_eq!(symbols(&frags), vec![None, Some("main")]);
    }

    #[test]
    fn test_no_definitions_yields_nothing() {
        let a = artifact("src/consts.rs", "// nothing here\nconst X: u8 = 1;\n");
        assert!(ApiSignatureExtractor.extract(&a).is_empty());
        let unknown = artifact("notes.txt", "def looks_like_python():\n");
        assert!(ApiSignatureExtractor.extract(&unknown).is_empty());
    }

    #[test]
    fn test_rust_impl_target() {
        assert_eq!(rust_impl_target(" Config {"), "Config");
        assert_eq!(rust_impl_target("<K, V> Cache<K, V> where K: Hash {"), "Cache");
        assert_eq!(rust_impl_target(" Iterator for Crawl {"), "Crawl");
        assert_eq!(rust_impl_target(" From<&str> for crate::models::Kind {"), "Kind");
    }
}
