// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirements.

A code requirement is a predicate over signed code: its certificate chain,
`Info.plist`, entitlements, identifier and code directory. Validation treats
requirements as opaque through the [Requirement] trait. Nested code seals
carry requirements as text, which a [RequirementCompiler] turns into a
[Requirement].

[ClauseRequirementCompiler] understands the subset of the requirement language
that signing tools emit for nested code: a conjunction of clauses such as

```text
identifier "com.example.helper" and anchor apple generic and certificate leaf[subject.OU] = "ABCDE12345"
```

Anything outside that subset fails to compile with
[ValidationStatus::ReqUnsupported].
*/

use {
    crate::{
        code_directory::CodeDirectory,
        error::{CodeValidationError, Result, ValidationStatus},
    },
    bcder::Oid,
    std::{fmt::Debug, sync::Arc},
    x509_certificate::CapturedX509Certificate,
};

/// Everything a requirement may inspect.
#[derive(Clone, Copy, Debug)]
pub struct RequirementContext<'a> {
    /// Signing certificate chain, leaf first. Empty for ad-hoc signatures.
    pub certificates: &'a [CapturedX509Certificate],
    /// Whether the chain is anchored by a vendor root.
    pub vendor_anchored: bool,
    pub info_plist: Option<&'a plist::Dictionary>,
    pub entitlements: Option<&'a plist::Dictionary>,
    pub identifier: &'a str,
    pub code_directory: &'a CodeDirectory,
}

/// A predicate over signed code.
pub trait Requirement: Debug + Send + Sync {
    /// Whether the code described by `context` satisfies this requirement.
    fn validates(&self, context: &RequirementContext) -> Result<bool>;
}

/// Turns requirement text into a [Requirement].
pub trait RequirementCompiler: Debug + Send + Sync {
    fn compile(&self, text: &str) -> Result<Arc<dyn Requirement>>;
}

/// A single term of a conjunction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequirementClause {
    /// Always satisfied.
    Always,
    /// The code directory identifier equals a value.
    Identifier(String),
    /// The canonical cdhash equals a value.
    CdHash(Vec<u8>),
    /// The chain is anchored by a vendor root.
    AnchorApple,
    /// The leaf certificate's subject OU equals a value.
    LeafOrganizationalUnit(String),
    /// An `Info.plist` string key equals a value.
    InfoKey(String, String),
}

/// A conjunction of [RequirementClause].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClauseRequirement {
    clauses: Vec<RequirementClause>,
}

impl ClauseRequirement {
    pub fn new(clauses: Vec<RequirementClause>) -> Self {
        Self { clauses }
    }

    pub fn clauses(&self) -> &[RequirementClause] {
        &self.clauses
    }
}

fn leaf_organizational_unit(cert: &CapturedX509Certificate) -> Option<String> {
    cert.subject_name()
        .find_first_attribute_string(Oid(
            x509_certificate::rfc4519::OID_ORGANIZATIONAL_UNIT_NAME
                .as_ref()
                .into(),
        ))
        .unwrap_or(None)
}

impl Requirement for ClauseRequirement {
    fn validates(&self, context: &RequirementContext) -> Result<bool> {
        for clause in &self.clauses {
            let ok = match clause {
                RequirementClause::Always => true,
                RequirementClause::Identifier(id) => context.identifier == id,
                RequirementClause::CdHash(hash) => {
                    &context.code_directory.cdhash()? == hash
                }
                RequirementClause::AnchorApple => context.vendor_anchored,
                RequirementClause::LeafOrganizationalUnit(ou) => context
                    .certificates
                    .first()
                    .and_then(leaf_organizational_unit)
                    .map(|value| &value == ou)
                    .unwrap_or(false),
                RequirementClause::InfoKey(key, value) => context
                    .info_plist
                    .and_then(|info| info.get(key))
                    .and_then(|v| v.as_string())
                    .map(|v| v == value)
                    .unwrap_or(false),
            };

            if !ok {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Hex(Vec<u8>),
}

fn invalid(message: impl ToString) -> CodeValidationError {
    CodeValidationError::detailed(ValidationStatus::ReqInvalid, message)
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            tokens.push(Token::Str(take_quoted(&mut chars)?));
        } else if c == '=' {
            chars.next();
            tokens.push(Token::Word("=".into()));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '=' || c == '"' {
                    break;
                }
                word.push(c);
                chars.next();
            }

            if word == "H" && chars.peek() == Some(&'"') {
                chars.next();
                let hex_text = take_quoted(&mut chars)?;
                tokens.push(Token::Hex(
                    hex::decode(&hex_text).map_err(|e| invalid(format!("bad hash literal: {}", e)))?,
                ));
            } else {
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

fn take_quoted(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<String> {
    let mut s = String::new();

    loop {
        match chars.next() {
            Some('"') => return Ok(s),
            Some('\\') => match chars.next() {
                Some(c) => s.push(c),
                None => return Err(invalid("unterminated string")),
            },
            Some(c) => s.push(c),
            None => return Err(invalid("unterminated string")),
        }
    }
}

/// Compiles conjunctions of simple clauses.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClauseRequirementCompiler;

impl ClauseRequirementCompiler {
    fn value(tokens: &mut impl Iterator<Item = Token>) -> Result<String> {
        match tokens.next() {
            Some(Token::Str(s)) | Some(Token::Word(s)) => Ok(s),
            other => Err(invalid(format!("expected a value; got {:?}", other))),
        }
    }

    fn expect_equals(tokens: &mut impl Iterator<Item = Token>) -> Result<()> {
        match tokens.next() {
            Some(Token::Word(w)) if w == "=" => Ok(()),
            other => Err(invalid(format!("expected '='; got {:?}", other))),
        }
    }

    pub fn parse(text: &str) -> Result<ClauseRequirement> {
        let mut tokens = tokenize(text)?.into_iter().peekable();
        let mut clauses = vec![];

        // A leading `designated =>` is accepted.
        if tokens.peek() == Some(&Token::Word("designated".into())) {
            tokens.next();
            match tokens.next() {
                Some(Token::Word(w)) if w == "=>" => {}
                other => return Err(invalid(format!("expected '=>'; got {:?}", other))),
            }
        }

        loop {
            let keyword = match tokens.next() {
                Some(Token::Word(w)) => w,
                other => return Err(invalid(format!("expected a clause; got {:?}", other))),
            };

            let clause = match keyword.as_str() {
                "always" => RequirementClause::Always,
                "identifier" => RequirementClause::Identifier(Self::value(&mut tokens)?),
                "cdhash" => match tokens.next() {
                    Some(Token::Hex(hash)) => RequirementClause::CdHash(hash),
                    other => {
                        return Err(invalid(format!("expected a hash literal; got {:?}", other)))
                    }
                },
                "anchor" => {
                    match tokens.next() {
                        Some(Token::Word(w)) if w == "apple" => {}
                        other => {
                            return Err(CodeValidationError::detailed(
                                ValidationStatus::ReqUnsupported,
                                format!("unsupported anchor {:?}", other),
                            ))
                        }
                    }

                    if tokens.peek() == Some(&Token::Word("generic".into())) {
                        tokens.next();
                    }

                    RequirementClause::AnchorApple
                }
                "certificate" => {
                    match tokens.next() {
                        Some(Token::Word(w)) if w == "leaf[subject.OU]" => {}
                        other => {
                            return Err(CodeValidationError::detailed(
                                ValidationStatus::ReqUnsupported,
                                format!("unsupported certificate field {:?}", other),
                            ))
                        }
                    }

                    Self::expect_equals(&mut tokens)?;

                    RequirementClause::LeafOrganizationalUnit(Self::value(&mut tokens)?)
                }
                "info" => {
                    let key = match tokens.next() {
                        Some(Token::Word(w)) if w.starts_with('[') && w.ends_with(']') => {
                            w[1..w.len() - 1].to_string()
                        }
                        other => return Err(invalid(format!("expected [key]; got {:?}", other))),
                    };

                    Self::expect_equals(&mut tokens)?;

                    RequirementClause::InfoKey(key, Self::value(&mut tokens)?)
                }
                other => {
                    return Err(CodeValidationError::detailed(
                        ValidationStatus::ReqUnsupported,
                        format!("unsupported requirement clause: {}", other),
                    ))
                }
            };

            clauses.push(clause);

            match tokens.next() {
                None => break,
                Some(Token::Word(w)) if w == "and" => continue,
                Some(other) => {
                    return Err(CodeValidationError::detailed(
                        ValidationStatus::ReqUnsupported,
                        format!("unsupported requirement operator: {:?}", other),
                    ))
                }
            }
        }

        Ok(ClauseRequirement::new(clauses))
    }
}

impl RequirementCompiler for ClauseRequirementCompiler {
    fn compile(&self, text: &str) -> Result<Arc<dyn Requirement>> {
        Ok(Arc::new(Self::parse(text)?))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            code_directory::{fixture_code_directory, CodeSignatureFlags},
            embedded_signature::DigestType,
        },
    };

    fn code_directory() -> CodeDirectory {
        CodeDirectory::parse(fixture_code_directory(
            DigestType::Sha256,
            "com.example.helper",
            None,
            0,
            b"helper",
            &[],
            CodeSignatureFlags::ADHOC,
        ))
        .unwrap()
    }

    #[test]
    fn parse_clauses() {
        let req = ClauseRequirementCompiler::parse(
            r#"identifier "com.example.helper" and anchor apple generic and certificate leaf[subject.OU] = ABCDE12345"#,
        )
        .unwrap();

        assert_eq!(
            req.clauses(),
            &[
                RequirementClause::Identifier("com.example.helper".into()),
                RequirementClause::AnchorApple,
                RequirementClause::LeafOrganizationalUnit("ABCDE12345".into()),
            ]
        );

        let req = ClauseRequirementCompiler::parse(r#"cdhash H"0a0b""#).unwrap();
        assert_eq!(req.clauses(), &[RequirementClause::CdHash(vec![10, 11])]);
    }

    #[test]
    fn unsupported_syntax() {
        let err = ClauseRequirementCompiler::parse(r#"identifier "a" or identifier "b""#)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::ReqUnsupported);

        let err = ClauseRequirementCompiler::parse(r#"identifier "a"#).unwrap_err();
        assert_eq!(err.status(), ValidationStatus::ReqInvalid);
    }

    #[test]
    fn evaluate_against_code_directory() {
        let cd = code_directory();
        let context = RequirementContext {
            certificates: &[],
            vendor_anchored: false,
            info_plist: None,
            entitlements: None,
            identifier: cd.identifier(),
            code_directory: &cd,
        };

        let text = format!(
            r#"designated => identifier "com.example.helper" and cdhash H"{}""#,
            hex::encode(cd.cdhash().unwrap())
        );
        let req = ClauseRequirementCompiler.compile(&text).unwrap();
        assert!(req.validates(&context).unwrap());

        let req = ClauseRequirementCompiler
            .compile(r#"identifier "com.example.other""#)
            .unwrap();
        assert!(!req.validates(&context).unwrap());

        let req = ClauseRequirementCompiler.compile("anchor apple").unwrap();
        assert!(!req.validates(&context).unwrap());
    }
}
