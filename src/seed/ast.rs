//! Tree-sitter definition discovery for seed extraction.
//!
//! Parses the head version of a changed file and reports every named
//! definition with its span, so the extractor can map changed lines to
//! their innermost enclosing definition.

use anyhow::Result;
use tree_sitter::{Language, Node};

use super::SymbolKind;

/// A named definition found in a source file.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    /// Ancestor definition names joined with `.`, innermost last
    pub qualified_name: Option<String>,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    /// Hash of the AST node-kind preorder within the definition subtree
    pub fingerprint: String,
}

impl Definition {
    /// Number of lines the definition spans.
    pub fn span(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.end_line
    }
}

/// Parses source files with tree-sitter to locate definitions
pub struct AstAnalyzer {
    rust_parser: tree_sitter::Parser,
    typescript_parser: tree_sitter::Parser,
    python_parser: tree_sitter::Parser,
    go_parser: tree_sitter::Parser,
    java_parser: tree_sitter::Parser,
    cpp_parser: tree_sitter::Parser,
}

impl AstAnalyzer {
    /// Create an analyzer with all supported language grammars loaded
    pub fn new() -> Result<Self> {
        Ok(Self {
            rust_parser: create_parser(tree_sitter_rust::LANGUAGE.into())?,
            typescript_parser: create_parser(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())?,
            python_parser: create_parser(tree_sitter_python::LANGUAGE.into())?,
            go_parser: create_parser(tree_sitter_go::LANGUAGE.into())?,
            java_parser: create_parser(tree_sitter_java::LANGUAGE.into())?,
            cpp_parser: create_parser(tree_sitter_cpp::LANGUAGE.into())?,
        })
    }

    /// All named definitions in a file, outermost first.
    ///
    /// Returns an empty list for unsupported languages or unparseable
    /// content; the caller falls back to file-level seeds.
    pub fn definitions(&mut self, file_path: &str, content: &str) -> Vec<Definition> {
        let Some(lang) = detect_language(file_path) else {
            return Vec::new();
        };

        let parser = match lang {
            "rust" => &mut self.rust_parser,
            "typescript" | "tsx" => &mut self.typescript_parser,
            "python" => &mut self.python_parser,
            "go" => &mut self.go_parser,
            "java" => &mut self.java_parser,
            "cpp" => &mut self.cpp_parser,
            _ => return Vec::new(),
        };

        let Some(tree) = parser.parse(content, None) else {
            return Vec::new();
        };

        let mut definitions = Vec::new();
        collect_definitions(&tree.root_node(), content, lang, &mut Vec::new(), &mut definitions);
        definitions
    }
}

fn create_parser(language: Language) -> Result<tree_sitter::Parser> {
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&language)?;
    Ok(parser)
}

/// Map a file extension to its grammar
pub fn detect_language(file_path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(file_path).extension()?.to_str()?;
    match ext {
        "rs" => Some("rust"),
        "ts" => Some("typescript"),
        "tsx" => Some("tsx"),
        "py" => Some("python"),
        "go" => Some("go"),
        "java" => Some("java"),
        "cpp" | "cc" | "hpp" | "cxx" => Some("cpp"),
        _ => None,
    }
}

fn collect_definitions(
    node: &Node,
    content: &str,
    language: &str,
    ancestors: &mut Vec<String>,
    out: &mut Vec<Definition>,
) {
    let matched = node_to_kind(node, language).and_then(|kind| {
        extract_name(node, content, language).map(|name| (kind, name))
    });

    if let Some((kind, name)) = &matched {
        let kind = adjust_nested_kind(*kind, ancestors, language);
        let qualified_name = if ancestors.is_empty() {
            None
        } else {
            Some(format!("{}.{}", ancestors.join("."), name))
        };
        out.push(Definition {
            name: name.clone(),
            qualified_name,
            kind,
            start_line: node.start_position().row as u32 + 1,
            end_line: node.end_position().row as u32 + 1,
            fingerprint: fingerprint_subtree(node),
        });
        ancestors.push(name.clone());
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_definitions(&child, content, language, ancestors, out);
    }

    if matched.is_some() {
        ancestors.pop();
    }
}

/// A function nested inside a class-like definition is a method.
fn adjust_nested_kind(kind: SymbolKind, ancestors: &[String], language: &str) -> SymbolKind {
    if kind == SymbolKind::Function
        && !ancestors.is_empty()
        && matches!(language, "python" | "typescript" | "tsx")
    {
        SymbolKind::Method
    } else {
        kind
    }
}

/// Map a tree-sitter node to a symbol kind
fn node_to_kind(node: &Node, language: &str) -> Option<SymbolKind> {
    let kind = node.kind();

    match language {
        "rust" => match kind {
            "function_item" => Some(SymbolKind::Function),
            "impl_item" => Some(SymbolKind::Impl),
            "struct_item" => Some(SymbolKind::Struct),
            "enum_item" => Some(SymbolKind::Enum),
            "trait_item" => Some(SymbolKind::Trait),
            "mod_item" => Some(SymbolKind::Module),
            _ => None,
        },
        "typescript" | "tsx" => match kind {
            "function_declaration" => Some(SymbolKind::Function),
            "method_definition" => Some(SymbolKind::Method),
            "class_declaration" => Some(SymbolKind::Class),
            "interface_declaration" => Some(SymbolKind::Interface),
            _ => None,
        },
        "python" => match kind {
            "function_definition" => Some(SymbolKind::Function),
            "class_definition" => Some(SymbolKind::Class),
            _ => None,
        },
        "go" => match kind {
            "function_declaration" => Some(SymbolKind::Function),
            "method_declaration" => Some(SymbolKind::Method),
            "type_declaration" => Some(SymbolKind::Struct),
            _ => None,
        },
        "java" => match kind {
            "method_declaration" | "constructor_declaration" => Some(SymbolKind::Method),
            "class_declaration" => Some(SymbolKind::Class),
            "interface_declaration" => Some(SymbolKind::Interface),
            "enum_declaration" => Some(SymbolKind::Enum),
            _ => None,
        },
        "cpp" => match kind {
            "function_definition" => Some(SymbolKind::Function),
            "class_specifier" => Some(SymbolKind::Class),
            "struct_specifier" => Some(SymbolKind::Struct),
            "enum_specifier" => Some(SymbolKind::Enum),
            _ => None,
        },
        _ => None,
    }
}

/// Extract the name of a definition node
fn extract_name(node: &Node, content: &str, language: &str) -> Option<String> {
    match language {
        "rust" | "typescript" | "tsx" | "python" | "java" => {
            let field = if node.kind() == "impl_item" { "type" } else { "name" };
            node.child_by_field_name(field)
                .map(|n| content[n.byte_range()].to_string())
        }
        "go" => {
            if node.kind() == "type_declaration" {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "type_spec" {
                        return child
                            .child_by_field_name("name")
                            .map(|n| content[n.byte_range()].to_string());
                    }
                }
                None
            } else {
                node.child_by_field_name("name")
                    .map(|n| content[n.byte_range()].to_string())
            }
        }
        "cpp" => {
            if let Some(name_node) = node.child_by_field_name("name") {
                return Some(content[name_node.byte_range()].to_string());
            }
            if let Some(declarator) = node.child_by_field_name("declarator") {
                if let Some(inner) = declarator.child_by_field_name("declarator") {
                    return Some(content[inner.byte_range()].to_string());
                }
                if declarator.kind() == "identifier" {
                    return Some(content[declarator.byte_range()].to_string());
                }
            }
            None
        }
        _ => None,
    }
}

/// Hash the node-kind preorder of a subtree.
///
/// Resilient to renames and literal edits; changes when the structure does.
fn fingerprint_subtree(node: &Node) -> String {
    use sha2::{Digest, Sha256};

    let mut kinds: Vec<&str> = Vec::new();
    collect_kinds(node, &mut kinds);
    let hash = Sha256::digest(kinds.join(",").as_bytes());
    hex::encode(&hash[..8])
}

fn collect_kinds<'a>(node: &Node<'a>, out: &mut Vec<&'a str>) {
    if node.is_named() {
        out.push(node.kind());
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_kinds(&child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_SOURCE: &str = "class Greeter:\n    def greet(self, name):\n        return f\"hi {name}\"\n\ndef main():\n    print(Greeter().greet(\"x\"))\n";

    #[test]
    fn test_python_definitions() {
        let mut analyzer = AstAnalyzer::new().unwrap();
        let defs = analyzer.definitions("app.py", PY_SOURCE);

        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"Greeter"));
        assert!(names.contains(&"greet"));
        assert!(names.contains(&"main"));

        let greet = defs.iter().find(|d| d.name == "greet").unwrap();
        assert_eq!(greet.kind, SymbolKind::Method);
        assert_eq!(greet.qualified_name.as_deref(), Some("Greeter.greet"));
        assert_eq!(greet.start_line, 2);

        let main = defs.iter().find(|d| d.name == "main").unwrap();
        assert_eq!(main.kind, SymbolKind::Function);
        assert!(main.qualified_name.is_none());
    }

    #[test]
    fn test_rust_definitions() {
        let source = "struct Point { x: i32 }\n\nimpl Point {\n    fn norm(&self) -> i32 { self.x }\n}\n";
        let mut analyzer = AstAnalyzer::new().unwrap();
        let defs = analyzer.definitions("geo.rs", source);

        assert!(defs.iter().any(|d| d.name == "Point" && d.kind == SymbolKind::Struct));
        let norm = defs.iter().find(|d| d.name == "norm").unwrap();
        assert_eq!(norm.qualified_name.as_deref(), Some("Point.norm"));
    }

    #[test]
    fn test_fingerprint_ignores_renames() {
        let mut analyzer = AstAnalyzer::new().unwrap();
        let a = analyzer.definitions("a.py", "def alpha(x):\n    return x + 1\n");
        let b = analyzer.definitions("b.py", "def beta(y):\n    return y + 2\n");
        assert_eq!(a[0].fingerprint, b[0].fingerprint);

        let c = analyzer.definitions("c.py", "def gamma(z):\n    if z:\n        return z\n    return 0\n");
        assert_ne!(a[0].fingerprint, c[0].fingerprint);
    }

    #[test]
    fn test_unsupported_language_returns_empty() {
        let mut analyzer = AstAnalyzer::new().unwrap();
        assert!(analyzer.definitions("notes.txt", "hello").is_empty());
        assert!(analyzer.definitions("noext", "hello").is_empty());
    }

    #[test]
    fn test_contains_line() {
        let def = Definition {
            name: "f".to_string(),
            qualified_name: None,
            kind: SymbolKind::Function,
            start_line: 5,
            end_line: 9,
            fingerprint: "abcd".to_string(),
        };
        assert!(def.contains_line(5));
        assert!(def.contains_line(9));
        assert!(!def.contains_line(4));
        assert!(!def.contains_line(10));
    }
}
