// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sealed resource directories.
//!
//! Bundles carry a `_CodeSignature/CodeResources` XML plist recording the
//! digest, symlink target or nested code requirement of every resource
//! file. The code directory seals the plist itself, so resource integrity
//! is verified transitively.
//!
//! The plist has two generations. Version 1 uses `files` and `rules`.
//! Version 2 adds `files2` and `rules2`, which are preferred when present.
//!
//! As with signing, values are coerced from [plist::Value] by hand because
//! seal entries are untagged unions.

use {
    crate::{
        embedded_signature::DigestType,
        error::{CodeValidationError, Result, ValidationStatus},
    },
    plist::{Dictionary, Value},
    std::collections::BTreeMap,
};

fn invalid_resources(message: impl ToString) -> CodeValidationError {
    CodeValidationError::detailed(ValidationStatus::ResourcesInvalid, message)
}

fn invalid_rules(message: impl ToString) -> CodeValidationError {
    CodeValidationError::detailed(ValidationStatus::ResourceRulesInvalid, message)
}

/// The sealed state of one resource.
#[derive(Clone, Eq, PartialEq)]
pub enum ResourceSeal {
    /// A regular file with one digest per algorithm.
    File {
        digests: BTreeMap<DigestType, Vec<u8>>,
        optional: bool,
    },
    /// A symbolic link and its literal target.
    Symlink { target: String, optional: bool },
    /// Nested code which must satisfy a requirement.
    Nested {
        requirement: String,
        cdhash: Option<Vec<u8>>,
        optional: bool,
    },
}

impl std::fmt::Debug for ResourceSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { digests, optional } => f
                .debug_struct("File")
                .field(
                    "digests",
                    &digests
                        .iter()
                        .map(|(k, v)| (*k, hex::encode(v)))
                        .collect::<BTreeMap<_, _>>(),
                )
                .field("optional", optional)
                .finish(),
            Self::Symlink { target, optional } => f
                .debug_struct("Symlink")
                .field("target", target)
                .field("optional", optional)
                .finish(),
            Self::Nested {
                requirement,
                cdhash,
                optional,
            } => f
                .debug_struct("Nested")
                .field("requirement", requirement)
                .field("cdhash", &cdhash.as_ref().map(hex::encode))
                .field("optional", optional)
                .finish(),
        }
    }
}

impl ResourceSeal {
    /// Parse an entry of `files` or `files2`.
    ///
    /// A bare `<data>` is a SHA-1 digest. Dictionaries carry `hash` (SHA-1),
    /// `hash2` (SHA-256), `symlink`, `requirement`, `cdhash` and `optional`.
    pub fn from_value(v: &Value) -> Result<Self> {
        let dict = match v {
            Value::Data(digest) => {
                return Ok(Self::File {
                    digests: [(DigestType::Sha1, digest.clone())].into_iter().collect(),
                    optional: false,
                })
            }
            Value::Dictionary(dict) => dict,
            _ => {
                return Err(invalid_resources(format!(
                    "bad seal value; expected <data> or <dict>, got {:?}",
                    v
                )))
            }
        };

        let mut digests = BTreeMap::new();
        let mut optional = false;
        let mut requirement = None;
        let mut cdhash = None;
        let mut symlink = None;

        for (key, value) in dict.iter() {
            match key.as_str() {
                "hash" | "hash2" => {
                    let data = value.as_data().ok_or_else(|| {
                        invalid_resources(format!("expected <data> for {} entry, got {:?}", key, value))
                    })?;

                    let digest_type = if key == "hash" {
                        DigestType::Sha1
                    } else {
                        DigestType::Sha256
                    };

                    digests.insert(digest_type, data.to_vec());
                }
                "optional" => {
                    optional = value.as_boolean().ok_or_else(|| {
                        invalid_resources(format!("expected boolean for optional key, got {:?}", value))
                    })?;
                }
                "requirement" => {
                    requirement = Some(
                        value
                            .as_string()
                            .ok_or_else(|| {
                                invalid_resources(format!(
                                    "expected string for requirement key, got {:?}",
                                    value
                                ))
                            })?
                            .to_string(),
                    );
                }
                "cdhash" => {
                    cdhash = Some(
                        value
                            .as_data()
                            .ok_or_else(|| {
                                invalid_resources(format!(
                                    "expected <data> for cdhash key, got {:?}",
                                    value
                                ))
                            })?
                            .to_vec(),
                    );
                }
                "symlink" => {
                    symlink = Some(
                        value
                            .as_string()
                            .ok_or_else(|| {
                                invalid_resources(format!(
                                    "expected string for symlink key, got {:?}",
                                    value
                                ))
                            })?
                            .to_string(),
                    );
                }
                // Unknown keys are tolerated for forward compatibility.
                _ => {}
            }
        }

        if let Some(requirement) = requirement {
            Ok(Self::Nested {
                requirement,
                cdhash,
                optional,
            })
        } else if let Some(target) = symlink {
            Ok(Self::Symlink { target, optional })
        } else if !digests.is_empty() {
            Ok(Self::File { digests, optional })
        } else {
            Err(invalid_resources("seal has no digest, symlink or requirement"))
        }
    }

    /// Whether the resource may be absent.
    pub fn optional(&self) -> bool {
        match self {
            Self::File { optional, .. }
            | Self::Symlink { optional, .. }
            | Self::Nested { optional, .. } => *optional,
        }
    }

    /// The sealed digest for an algorithm, if this seals a file.
    pub fn digest(&self, digest_type: DigestType) -> Option<&[u8]> {
        match self {
            Self::File { digests, .. } => digests.get(&digest_type).map(|x| x.as_slice()),
            _ => None,
        }
    }
}

/// A resource rule from `rules` or `rules2`, or an exclusion added by a
/// disk representation.
#[derive(Clone, Debug)]
pub struct ResourceRule {
    /// The rule pattern, a regular expression.
    pub pattern: String,

    /// Excluded paths are skipped entirely, including directory subtrees.
    pub exclude: bool,

    /// Matching directories with a `.` in their name are nested code.
    pub nested: bool,

    /// Matching files are not sealed.
    pub omit: bool,

    pub optional: bool,

    pub weight: u32,

    /// The plist value was a bare `<true/>`.
    pub plain: bool,

    re: regex::Regex,
}

impl PartialEq for ResourceRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.exclude == other.exclude
            && self.nested == other.nested
            && self.omit == other.omit
            && self.optional == other.optional
            && self.weight == other.weight
            && self.plain == other.plain
    }
}

impl Eq for ResourceRule {}

impl ResourceRule {
    pub fn new(pattern: impl ToString) -> Result<Self> {
        let pattern = pattern.to_string();

        Ok(Self {
            re: regex::Regex::new(&pattern)
                .map_err(|e| CodeValidationError::BadRegex(pattern.clone(), e))?,
            pattern,
            exclude: false,
            nested: false,
            omit: false,
            optional: false,
            weight: 1,
            plain: true,
        })
    }

    /// Mark this as an exclusion rule.
    #[must_use]
    pub fn exclude(mut self) -> Self {
        self.exclude = true;
        self.plain = false;
        self
    }

    #[must_use]
    pub fn nested(mut self) -> Self {
        self.nested = true;
        self.plain = false;
        self
    }

    #[must_use]
    pub fn omit(mut self) -> Self {
        self.omit = true;
        self.plain = false;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self.plain = false;
        self
    }

    #[must_use]
    pub fn weight(mut self, v: u32) -> Self {
        self.weight = v;
        self.plain = false;
        self
    }

    /// Parse a rule from its plist key and value.
    ///
    /// `<true/>` is an inclusion rule, `<false/>` an omission. Dictionaries
    /// may carry `omit`, `optional`, `nested` and `weight`.
    pub fn from_plist(pattern: &str, value: &Value) -> Result<Self> {
        let rule = Self::new(pattern)?;

        match value {
            Value::Boolean(true) => Ok(rule),
            Value::Boolean(false) => Ok(rule.omit()),
            Value::Dictionary(dict) => {
                let mut rule = Self {
                    plain: false,
                    ..rule
                };

                for (key, value) in dict {
                    match key.as_str() {
                        "omit" | "optional" | "nested" => {
                            let v = value.as_boolean().ok_or_else(|| {
                                invalid_rules(format!(
                                    "rule {} key {} not a boolean; got {:?}",
                                    pattern, key, value
                                ))
                            })?;

                            match key.as_str() {
                                "omit" => rule.omit = v,
                                "optional" => rule.optional = v,
                                _ => rule.nested = v,
                            }
                        }
                        "weight" => {
                            let weight = value
                                .as_real()
                                .or_else(|| value.as_unsigned_integer().map(|x| x as f64))
                                .ok_or_else(|| {
                                    invalid_rules(format!(
                                        "rule {} weight not a number; got {:?}",
                                        pattern, value
                                    ))
                                })?;

                            rule.weight = weight as u32;
                        }
                        key => {
                            return Err(invalid_rules(format!(
                                "extra key in rule {}: {}",
                                pattern, key
                            )));
                        }
                    }
                }

                Ok(rule)
            }
            _ => Err(invalid_rules(format!(
                "invalid value for rule {}: {:?}",
                pattern, value
            ))),
        }
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.re.is_match(path)
    }
}

/// An ordered set of resource rules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceRuleSet {
    rules: Vec<ResourceRule>,
}

impl ResourceRuleSet {
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        Ok(Self {
            rules: dict
                .iter()
                .map(|(key, value)| ResourceRule::from_plist(key, value))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn add_rule(&mut self, rule: ResourceRule) {
        self.rules.push(rule);
    }

    /// Add an exclusion for a pattern.
    pub fn add_exclusion(&mut self, pattern: &str) -> Result<()> {
        self.rules.push(ResourceRule::new(pattern)?.exclude());

        Ok(())
    }

    pub fn rules(&self) -> &[ResourceRule] {
        &self.rules
    }

    /// Find the rule governing a path.
    ///
    /// A matching exclusion wins immediately. Otherwise the matching rule with
    /// the highest weight wins, earlier rules winning ties.
    pub fn find_rule(&self, path: &str) -> Option<&ResourceRule> {
        let mut best: Option<&ResourceRule> = None;

        for rule in &self.rules {
            if !rule.is_match(path) {
                continue;
            }

            if rule.exclude {
                return Some(rule);
            }

            if best.map(|b| rule.weight > b.weight).unwrap_or(true) {
                best = Some(rule);
            }
        }

        best
    }

    /// Whether a path falls inside the sealed envelope.
    pub fn includes(&self, path: &str) -> bool {
        self.find_rule(path)
            .map(|rule| !rule.omit && !rule.exclude)
            .unwrap_or(false)
    }

    /// Whether the rules fail to seal enough.
    ///
    /// Rules are weak when the version's catch-all rule is absent (or is not
    /// a bare `<true/>`) or when they omit a pattern not in `allowed`.
    pub fn has_weak_rules(&self, version: u32, allowed: &[String]) -> bool {
        let catch_all = if version == 1 { "^Resources/" } else { "^.*" };

        let covers_all = self
            .rules
            .iter()
            .any(|rule| rule.pattern == catch_all && rule.plain);

        let forbidden_omission = self
            .rules
            .iter()
            .filter(|rule| !rule.exclude && rule.omit && !(rule.pattern == catch_all && rule.plain))
            .any(|rule| !allowed.iter().any(|a| a == &rule.pattern));

        !covers_all || forbidden_omission
    }
}

/// A parsed `CodeResources` plist.
#[derive(Clone, Debug)]
pub struct SealedResources {
    version: u32,
    files: BTreeMap<String, Value>,
    rules: ResourceRuleSet,
    rules1: Option<Dictionary>,
    raw: Dictionary,
}

impl SealedResources {
    /// Parse from the plist dictionary.
    ///
    /// `files2`/`rules2` are used when `files2` is present. The chosen
    /// generation must have both a files and a rules dictionary.
    pub fn from_dictionary(dict: Dictionary) -> Result<Self> {
        let (version, files_key, rules_key) = if dict.contains_key("files2") {
            (2, "files2", "rules2")
        } else {
            (1, "files", "rules")
        };

        let files = dict
            .get(files_key)
            .and_then(|v| v.as_dictionary())
            .ok_or_else(|| invalid_resources(format!("missing {} dictionary", files_key)))?
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>();

        let rules = ResourceRuleSet::from_dictionary(
            dict.get(rules_key)
                .and_then(|v| v.as_dictionary())
                .ok_or_else(|| invalid_resources(format!("missing {} dictionary", rules_key)))?,
        )?;

        let rules1 = dict
            .get("rules")
            .and_then(|v| v.as_dictionary())
            .cloned();

        Ok(Self {
            version,
            files,
            rules,
            rules1,
            raw: dict,
        })
    }

    pub fn from_xml(data: &[u8]) -> Result<Self> {
        let value = Value::from_reader_xml(data)?;

        let dict = value.into_dictionary().ok_or_else(|| {
            CodeValidationError::detailed(
                ValidationStatus::BadDictionaryFormat,
                "resource directory root is not a dictionary",
            )
        })?;

        Self::from_dictionary(dict)
    }

    /// Seal generation in use: 1 or 2.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Raw seal entries keyed by relative path.
    pub fn files(&self) -> &BTreeMap<String, Value> {
        &self.files
    }

    /// Parse the seal of a path.
    ///
    /// `None` if the path is not sealed.
    pub fn seal(&self, path: &str) -> Option<Result<ResourceSeal>> {
        self.files.get(path).map(ResourceSeal::from_value)
    }

    pub fn rules(&self) -> &ResourceRuleSet {
        &self.rules
    }

    /// The version 1 rules, regardless of the generation in use.
    pub fn legacy_rules(&self) -> Result<Option<ResourceRuleSet>> {
        self.rules1
            .as_ref()
            .map(ResourceRuleSet::from_dictionary)
            .transpose()
    }

    /// Estimated resource work: the number of sealed entries.
    pub fn workload(&self) -> usize {
        self.files.len()
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCES: &str = indoc::indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
          <key>files</key>
          <dict>
            <key>Resources/a.txt</key>
            <data>AAECAwQFBgcICQoLDA0ODxAREhM=</data>
          </dict>
          <key>files2</key>
          <dict>
            <key>Resources/a.txt</key>
            <dict>
              <key>hash</key>
              <data>AAECAwQFBgcICQoLDA0ODxAREhM=</data>
              <key>hash2</key>
              <data>AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=</data>
            </dict>
            <key>Resources/link</key>
            <dict>
              <key>symlink</key>
              <string>a.txt</string>
            </dict>
            <key>Frameworks/A.framework</key>
            <dict>
              <key>cdhash</key>
              <data>AAECAwQFBgcICQoLDA0ODxAREhM=</data>
              <key>requirement</key>
              <string>identifier "com.example.a"</string>
            </dict>
            <key>Resources/maybe.txt</key>
            <dict>
              <key>hash2</key>
              <data>AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=</data>
              <key>optional</key>
              <true/>
            </dict>
          </dict>
          <key>rules</key>
          <dict>
            <key>^Resources/</key>
            <true/>
            <key>^Resources/.*\.lproj/</key>
            <dict>
              <key>optional</key>
              <true/>
              <key>weight</key>
              <real>1000</real>
            </dict>
            <key>^Resources/.*\.lproj/locversion.plist$</key>
            <dict>
              <key>omit</key>
              <true/>
              <key>weight</key>
              <real>1100</real>
            </dict>
          </dict>
          <key>rules2</key>
          <dict>
            <key>^.*</key>
            <true/>
            <key>^(.*/)?\.DS_Store$</key>
            <dict>
              <key>omit</key>
              <true/>
              <key>weight</key>
              <real>2000</real>
            </dict>
            <key>^(Frameworks|PlugIns)/</key>
            <dict>
              <key>nested</key>
              <true/>
              <key>weight</key>
              <real>10</real>
            </dict>
            <key>^Info\.plist$</key>
            <dict>
              <key>omit</key>
              <true/>
              <key>weight</key>
              <real>20</real>
            </dict>
          </dict>
        </dict>
        </plist>
    "#};

    #[test]
    fn parse_v2() -> Result<()> {
        let resources = SealedResources::from_xml(RESOURCES.as_bytes())?;

        assert_eq!(resources.version(), 2);
        assert_eq!(resources.workload(), 4);

        let seal = resources.seal("Resources/a.txt").unwrap()?;
        assert_eq!(seal.digest(DigestType::Sha1).map(|d| d.len()), Some(20));
        assert_eq!(seal.digest(DigestType::Sha256).map(|d| d.len()), Some(32));
        assert!(!seal.optional());

        assert_eq!(
            resources.seal("Resources/link").unwrap()?,
            ResourceSeal::Symlink {
                target: "a.txt".into(),
                optional: false
            }
        );
        assert!(matches!(
            resources.seal("Frameworks/A.framework").unwrap()?,
            ResourceSeal::Nested { cdhash: Some(_), .. }
        ));
        assert!(resources.seal("Resources/maybe.txt").unwrap()?.optional());
        assert!(resources.seal("Resources/b.txt").is_none());

        assert_eq!(resources.legacy_rules()?.unwrap().rules().len(), 3);

        Ok(())
    }

    #[test]
    fn rule_selection() -> Result<()> {
        let resources = SealedResources::from_xml(RESOURCES.as_bytes())?;
        let rules = resources.rules();

        assert_eq!(rules.find_rule("Resources/a.txt").unwrap().pattern, "^.*");
        assert!(rules.find_rule("Resources/.DS_Store").unwrap().omit);
        assert!(rules.find_rule("Frameworks/A.framework").unwrap().nested);
        assert!(rules.includes("Resources/a.txt"));
        assert!(!rules.includes("Info.plist"));

        let mut rules = rules.clone();
        rules.add_exclusion("^_CodeSignature$")?;
        assert!(rules.find_rule("_CodeSignature").unwrap().exclude);
        assert!(!rules.includes("_CodeSignature"));

        Ok(())
    }

    #[test]
    fn weak_rules() -> Result<()> {
        let resources = SealedResources::from_xml(RESOURCES.as_bytes())?;
        let allowed = vec!["^(.*/)?\\.DS_Store$".to_string(), "^Info\\.plist$".to_string()];

        assert!(!resources.rules().has_weak_rules(2, &allowed));
        assert!(resources.rules().has_weak_rules(2, &allowed[..1]));

        let legacy = resources.legacy_rules()?.unwrap();
        assert!(legacy.has_weak_rules(1, &allowed));
        assert!(!legacy.has_weak_rules(
            1,
            &["^Resources/.*\\.lproj/locversion.plist$".to_string()]
        ));

        let mut missing_catch_all = ResourceRuleSet::default();
        missing_catch_all.add_rule(ResourceRule::new("^.*")?.weight(5));
        assert!(missing_catch_all.has_weak_rules(2, &[]));

        Ok(())
    }

    #[test]
    fn missing_generation_is_invalid() {
        let mut dict = Dictionary::new();
        dict.insert("files2".into(), Value::Dictionary(Dictionary::new()));

        let err = SealedResources::from_dictionary(dict).unwrap_err();
        assert_eq!(err.status(), ValidationStatus::ResourcesInvalid);
    }

    #[test]
    fn bad_seals() {
        assert!(ResourceSeal::from_value(&Value::Boolean(true)).is_err());
        assert!(ResourceSeal::from_value(&Value::Dictionary(Dictionary::new())).is_err());
    }
}
