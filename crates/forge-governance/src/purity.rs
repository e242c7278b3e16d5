//! Purity classification
//!
//! Separates pure business logic from side-effecting integration code. The
//! detection strategy sits behind the [`PurityClassifier`] trait; the
//! default [`PatternClassifier`] matches a fixed set of indicator patterns.
//! [`PurityGate`] consumes the verdicts, places each module in its layer and
//! reports architecture violations.

use crate::error::GovernanceError;
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Kind of side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    /// Network access
    Network,
    /// Filesystem access
    File,
    /// Console output
    Console,
    /// Wall-clock reads
    Clock,
    /// Randomness
    Random,
    /// `async` / `await` markers
    Async,
    /// Mutation of objects outside the function
    ExternalMutation,
}

impl fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SideEffectKind::Network => "network",
            SideEffectKind::File => "file",
            SideEffectKind::Console => "console",
            SideEffectKind::Clock => "clock",
            SideEffectKind::Random => "random",
            SideEffectKind::Async => "async",
            SideEffectKind::ExternalMutation => "external_mutation",
        };
        f.write_str(s)
    }
}

/// One detected side effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffect {
    /// Kind
    pub kind: SideEffectKind,
    /// Matched text
    pub indicator: String,
    /// 1-based line within the analysed source
    pub line: usize,
}

/// Side-effect detection strategy
pub trait PurityClassifier: Send + Sync {
    /// Side effects present in `source`
    fn side_effects(&self, source: &str) -> Vec<SideEffect>;
}

const STANDARD_INDICATORS: &[(SideEffectKind, &str)] = &[
    (
        SideEffectKind::Network,
        r"\b(fetch|axios|XMLHttpRequest|WebSocket|reqwest|TcpStream|UdpSocket|urllib|requests\.\w+)\b",
    ),
    (
        SideEffectKind::File,
        r"\b(fs\.\w+|readFileSync|writeFileSync|std::fs|File::open|File::create|fopen)\b|\bopen\(",
    ),
    (
        SideEffectKind::Console,
        r"\b(console\.(log|error|warn|info|debug)|println!|eprintln!|dbg!)|\bprint\(",
    ),
    (
        SideEffectKind::Clock,
        r"\b(Date\.now|new Date|performance\.now|SystemTime::now|Instant::now|Utc::now|Local::now|time\.time)\b",
    ),
    (
        SideEffectKind::Random,
        r"\b(Math\.random|thread_rng|rand::\w+|random\.\w+|crypto\.getRandomValues)\b",
    ),
    (SideEffectKind::Async, r"\b(async|await)\b"),
    (
        SideEffectKind::ExternalMutation,
        r"\b(window|document|globalThis|localStorage|sessionStorage|process\.env)\.\w+\s*=[^=]|\bstatic\s+mut\b",
    ),
];

static STANDARD: Lazy<Result<Vec<(SideEffectKind, Regex)>, GovernanceError>> =
    Lazy::new(|| compile(STANDARD_INDICATORS.iter().copied()));

fn compile<'a>(
    patterns: impl IntoIterator<Item = (SideEffectKind, &'a str)>,
) -> Result<Vec<(SideEffectKind, Regex)>, GovernanceError> {
    patterns
        .into_iter()
        .map(|(kind, pattern)| {
            Regex::new(pattern)
                .map(|re| (kind, re))
                .map_err(|e| GovernanceError::InvalidIndicator {
                    kind: kind.to_string(),
                    message: e.to_string(),
                })
        })
        .collect()
}

/// Regex indicator classifier
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    indicators: Vec<(SideEffectKind, Regex)>,
}

impl PatternClassifier {
    /// Classifier with the standard indicator set
    ///
    /// # Errors
    /// `GovernanceError::InvalidIndicator` if an indicator does not compile.
    pub fn standard() -> Result<Self, GovernanceError> {
        match STANDARD.as_ref() {
            Ok(indicators) => Ok(Self {
                indicators: indicators.clone(),
            }),
            Err(GovernanceError::InvalidIndicator { kind, message }) => {
                Err(GovernanceError::InvalidIndicator {
                    kind: kind.clone(),
                    message: message.clone(),
                })
            }
            Err(other) => Err(GovernanceError::InvalidIndicator {
                kind: "standard".into(),
                message: other.to_string(),
            }),
        }
    }

    /// Classifier with custom indicators
    ///
    /// # Errors
    /// `GovernanceError::InvalidIndicator` if an indicator does not compile.
    pub fn from_patterns<'a>(
        patterns: impl IntoIterator<Item = (SideEffectKind, &'a str)>,
    ) -> Result<Self, GovernanceError> {
        Ok(Self {
            indicators: compile(patterns)?,
        })
    }
}

impl PurityClassifier for PatternClassifier {
    fn side_effects(&self, source: &str) -> Vec<SideEffect> {
        let mut found = Vec::new();
        for (index, line) in source.lines().enumerate() {
            let code = strip_line_comment(line);
            for (kind, re) in &self.indicators {
                if let Some(m) = re.find(code) {
                    found.push(SideEffect {
                        kind: *kind,
                        indicator: m.as_str().trim().to_string(),
                        line: index + 1,
                    });
                }
            }
        }
        found
    }
}

fn strip_line_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") || trimmed.starts_with('#') {
        return "";
    }
    match line.find(" //") {
        Some(at) => &line[..at],
        None => line,
    }
}

/// Architectural layer of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Pure domain logic
    BusinessLogic,
    /// Adapters to the outside world
    Integration,
    /// Neither
    Unclassified,
}

/// Maps module paths to layers by path segment
#[derive(Debug, Clone)]
pub struct LayerResolver {
    rules: Vec<(String, Layer)>,
}

impl Default for LayerResolver {
    fn default() -> Self {
        let business = ["domain", "core", "business", "logic", "model", "models", "rules"];
        let integration = [
            "api", "adapters", "adapter", "integration", "infra", "infrastructure", "services",
            "handlers", "db", "io", "clients",
        ];
        Self {
            rules: business
                .iter()
                .map(|s| ((*s).to_string(), Layer::BusinessLogic))
                .chain(integration.iter().map(|s| ((*s).to_string(), Layer::Integration)))
                .collect(),
        }
    }
}

impl LayerResolver {
    /// Resolver with no rules; everything is unclassified
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule; earlier rules win
    #[inline]
    #[must_use]
    pub fn with_rule(mut self, segment: impl Into<String>, layer: Layer) -> Self {
        self.rules.push((segment.into(), layer));
        self
    }

    /// Layer of the module at `path`, decided by its leftmost matching directory
    #[must_use]
    pub fn resolve(&self, path: &str) -> Layer {
        let mut segments: Vec<&str> = path.split(['/', '\\']).filter(|s| !s.is_empty()).collect();
        // the file name itself carries no layer
        segments.pop();
        segments
            .iter()
            .find_map(|segment| {
                self.rules
                    .iter()
                    .find(|(rule, _)| rule.eq_ignore_ascii_case(segment))
                    .map(|(_, layer)| *layer)
            })
            .unwrap_or(Layer::Unclassified)
    }
}

/// Source file submitted for analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Module path
    pub path: String,
    /// Source text
    pub content: String,
}

impl SourceFile {
    /// Create a source file
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Classification of one function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPurity {
    /// Function name
    pub name: String,
    /// Effects found in its body
    pub effects: Vec<SideEffect>,
}

impl FunctionPurity {
    /// Whether no effect was found
    #[inline]
    #[must_use]
    pub fn is_pure(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Classification of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePurity {
    /// Module path
    pub path: String,
    /// Layer
    pub layer: Layer,
    /// Functions in source order
    pub functions: Vec<FunctionPurity>,
    /// Effects outside any function
    pub top_level_effects: Vec<SideEffect>,
}

impl ModulePurity {
    /// Distinct effect kinds anywhere in the module
    #[must_use]
    pub fn effect_kinds(&self) -> BTreeSet<SideEffectKind> {
        self.functions
            .iter()
            .flat_map(|f| f.effects.iter())
            .chain(self.top_level_effects.iter())
            .map(|e| e.kind)
            .collect()
    }

    /// Whether any indicator matched
    #[inline]
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        !self.top_level_effects.is_empty() || self.functions.iter().any(|f| !f.is_pure())
    }
}

/// Business logic module with side effects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureViolation {
    /// Module path
    pub path: String,
    /// Offending functions
    pub functions: Vec<String>,
    /// Effect kinds found
    pub effects: BTreeSet<SideEffectKind>,
}

/// Outcome of analysing a set of files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurityReport {
    /// Per-module classifications
    pub modules: Vec<ModulePurity>,
    /// Business-logic modules matching any indicator
    pub violations: Vec<ArchitectureViolation>,
    /// Integration modules matching no indicator
    pub suspicious: Vec<String>,
}

impl PurityReport {
    /// True iff there is no architecture violation
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

static FUNCTION_HEAD: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:export[ \t]+)?(?:pub(?:\([^)]*\))?[ \t]+)?(?:async[ \t]+)?(?:fn|function|def)[ \t]+([A-Za-z_][A-Za-z0-9_]*)|^[ \t]*(?:export[ \t]+)?(?:const|let)[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*=[ \t]*(?:async[ \t]*)?\([^)]*\)[ \t]*=>",
    )
});

/// Split source into a top-level preamble and `(name, offset, body)` triples
fn split_functions(source: &str) -> (&str, Vec<(&str, usize, &str)>) {
    let Ok(head) = FUNCTION_HEAD.as_ref() else {
        return (source, Vec::new());
    };
    let starts: Vec<(usize, &str)> = head
        .captures_iter(source)
        .filter_map(|caps| {
            let start = caps.get(0)?.start();
            let name = caps.get(1).or_else(|| caps.get(2))?.as_str();
            Some((start, name))
        })
        .collect();

    let preamble_end = starts.first().map_or(source.len(), |(start, _)| *start);
    let functions = starts
        .iter()
        .enumerate()
        .map(|(i, (start, name))| {
            let end = starts.get(i + 1).map_or(source.len(), |(next, _)| *next);
            (*name, *start, &source[*start..end])
        })
        .collect();
    (&source[..preamble_end], functions)
}

/// Layer-aware purity analysis with a content-addressed cache
pub struct PurityGate {
    classifier: Arc<dyn PurityClassifier>,
    resolver: LayerResolver,
    cache: Cache<[u8; 32], Arc<ModulePurity>>,
}

impl fmt::Debug for PurityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurityGate")
            .field("resolver", &self.resolver)
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl PurityGate {
    /// Create a gate
    #[must_use]
    pub fn new(classifier: Arc<dyn PurityClassifier>, resolver: LayerResolver, cache_capacity: u64) -> Self {
        Self {
            classifier,
            resolver,
            cache: Cache::new(cache_capacity),
        }
    }

    /// Gate with the standard classifier and resolver
    ///
    /// # Errors
    /// `GovernanceError::InvalidIndicator` if an indicator does not compile.
    pub fn standard(cache_capacity: u64) -> Result<Self, GovernanceError> {
        Ok(Self::new(
            Arc::new(PatternClassifier::standard()?),
            LayerResolver::default(),
            cache_capacity,
        ))
    }

    /// Classify one module
    pub async fn classify(&self, file: &SourceFile) -> Arc<ModulePurity> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(file.path.as_bytes());
        hasher.update(&[0]);
        hasher.update(file.content.as_bytes());
        let key = *hasher.finalize().as_bytes();

        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(path = %file.path, "purity cache hit");
            return hit;
        }

        let module = Arc::new(self.classify_uncached(file));
        self.cache.insert(key, Arc::clone(&module)).await;
        module
    }

    fn classify_uncached(&self, file: &SourceFile) -> ModulePurity {
        let layer = self.resolver.resolve(&file.path);
        let (preamble, bodies) = split_functions(&file.content);

        let functions = bodies
            .into_iter()
            .map(|(name, start, body)| {
                let offset = file.content[..start].matches('\n').count();
                let effects = self
                    .classifier
                    .side_effects(body)
                    .into_iter()
                    .map(|e| SideEffect {
                        line: e.line + offset,
                        ..e
                    })
                    .collect();
                FunctionPurity {
                    name: name.to_string(),
                    effects,
                }
            })
            .collect();

        ModulePurity {
            path: file.path.clone(),
            layer,
            functions,
            top_level_effects: self.classifier.side_effects(preamble),
        }
    }

    /// Analyse a set of files
    pub async fn analyze(&self, files: &[SourceFile]) -> PurityReport {
        let mut report = PurityReport::default();

        for file in files {
            let module = self.classify(file).await;
            match module.layer {
                Layer::BusinessLogic if module.has_side_effects() => {
                    let functions: Vec<String> = module
                        .functions
                        .iter()
                        .filter(|f| !f.is_pure())
                        .map(|f| f.name.clone())
                        .collect();
                    tracing::warn!(
                        path = %module.path,
                        functions = ?functions,
                        "side effects in business logic"
                    );
                    report.violations.push(ArchitectureViolation {
                        path: module.path.clone(),
                        functions,
                        effects: module.effect_kinds(),
                    });
                }
                Layer::Integration if !module.has_side_effects() => {
                    tracing::debug!(path = %module.path, "integration module performs no side effects");
                    report.suspicious.push(module.path.clone());
                }
                _ => {}
            }
            report.modules.push(module.as_ref().clone());
        }

        report
    }

    /// Number of cached module classifications
    #[inline]
    #[must_use]
    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<SideEffectKind> {
        PatternClassifier::standard()
            .unwrap()
            .side_effects(source)
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn standard_indicators_detect_each_kind() {
        assert_eq!(kinds("const r = await fetch(url);"), vec![SideEffectKind::Network, SideEffectKind::Async]);
        assert_eq!(kinds("let f = File::open(path)?;"), vec![SideEffectKind::File]);
        assert_eq!(kinds("console.log(total);"), vec![SideEffectKind::Console]);
        assert_eq!(kinds("const t = Date.now();"), vec![SideEffectKind::Clock]);
        assert_eq!(kinds("let n = Math.random();"), vec![SideEffectKind::Random]);
        assert_eq!(kinds("window.title = 'x';"), vec![SideEffectKind::ExternalMutation]);
        assert!(kinds("function add(a, b) { return a + b; }").is_empty());
    }

    #[test]
    fn comments_are_ignored() {
        assert!(kinds("// console.log(debug)").is_empty());
        assert!(kinds("let x = 1; // fetch later").is_empty());
    }

    #[test]
    fn layers_resolve_by_directory() {
        let resolver = LayerResolver::default();
        assert_eq!(resolver.resolve("src/domain/pricing.ts"), Layer::BusinessLogic);
        assert_eq!(resolver.resolve("src/api/orders.ts"), Layer::Integration);
        assert_eq!(resolver.resolve("src/util/strings.ts"), Layer::Unclassified);
        // file names do not count
        assert_eq!(resolver.resolve("src/domain.ts"), Layer::Unclassified);
    }

    #[test]
    fn functions_are_split_in_source_order() {
        let source = "import x from 'y';\nfunction a() {}\nexport async function b() {}\nconst c = (n) => n;\n";
        let (preamble, functions) = split_functions(source);
        assert_eq!(preamble, "import x from 'y';\n");
        let names: Vec<&str> = functions.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn business_logic_with_effects_is_a_violation() {
        let gate = PurityGate::standard(64).unwrap();
        let files = vec![
            SourceFile::new(
                "src/domain/pricing.ts",
                "export function total(items) {\n  return items.reduce((a, b) => a + b, 0);\n}\nexport function stamp(order) {\n  console.log(order);\n  return Date.now();\n}\n",
            ),
            SourceFile::new(
                "src/api/client.ts",
                "export async function load() {\n  return await fetch('/orders');\n}\n",
            ),
        ];

        let report = gate.analyze(&files).await;
        assert!(!report.is_clean());
        assert_eq!(report.violations.len(), 1);
        let violation = &report.violations[0];
        assert_eq!(violation.path, "src/domain/pricing.ts");
        assert_eq!(violation.functions, vec!["stamp".to_string()]);
        assert_eq!(
            violation.effects,
            BTreeSet::from([SideEffectKind::Console, SideEffectKind::Clock])
        );
        assert!(report.suspicious.is_empty());

        let stamp = &report.modules[0].functions[1];
        assert_eq!(stamp.effects[0].line, 5);
    }

    #[tokio::test]
    async fn idle_integration_module_is_suspicious() {
        let gate = PurityGate::standard(64).unwrap();
        let files = vec![SourceFile::new(
            "src/adapters/noop.ts",
            "export function map(x) { return x; }\n",
        )];
        let report = gate.analyze(&files).await;
        assert!(report.is_clean());
        assert_eq!(report.suspicious, vec!["src/adapters/noop.ts".to_string()]);
    }

    #[tokio::test]
    async fn classifications_are_cached_by_content() {
        let gate = PurityGate::standard(64).unwrap();
        let file = SourceFile::new("src/domain/a.ts", "function a() { return 1; }");
        let first = gate.classify(&file).await;
        let second = gate.classify(&file).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    struct Paranoid;

    impl PurityClassifier for Paranoid {
        fn side_effects(&self, source: &str) -> Vec<SideEffect> {
            if source.trim().is_empty() {
                return Vec::new();
            }
            vec![SideEffect {
                kind: SideEffectKind::ExternalMutation,
                indicator: "anything".into(),
                line: 1,
            }]
        }
    }

    #[tokio::test]
    async fn classifier_is_swappable() {
        let gate = PurityGate::new(Arc::new(Paranoid), LayerResolver::default(), 8);
        let report = gate
            .analyze(&[SourceFile::new("src/domain/a.ts", "function a() { return 1; }")])
            .await;
        assert_eq!(report.violations.len(), 1);
    }
}
