//! seks_policy
//!
//! Combines the classifier/template classification with the configured
//! enforcement mode into an admit/deny/approval-required decision. Not a
//! general policy engine — just this one table.

use seks_templates::{classify, Classification, Invocation, TemplateClassification, TemplateRegistry};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Strict,
    Moderate,
    Permissive,
}

impl PolicyMode {
    pub fn allow_arbitrary(&self) -> bool {
        !matches!(self, PolicyMode::Strict)
    }

    /// "sandbox" for strict/moderate, "gateway" for permissive, per the
    /// mode table. Exposed for callers that pick a default exec host.
    pub fn default_host(&self) -> &'static str {
        match self {
            PolicyMode::Strict | PolicyMode::Moderate => "sandbox",
            PolicyMode::Permissive => "gateway",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecRequest {
    Template { template_id: String, params: HashMap<String, String> },
    Arbitrary { command: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    Template,
    Allowlist,
    Denied,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub mode: ResolutionMode,
    pub requires_approval: bool,
    pub argv: Option<Vec<String>>,
    pub reason: Option<String>,
    pub suggestion: Option<String>,
}

impl PolicyDecision {
    fn denied(reason: impl Into<String>, suggestion: Option<String>) -> Self {
        Self {
            allowed: false,
            mode: ResolutionMode::Denied,
            requires_approval: false,
            argv: None,
            reason: Some(reason.into()),
            suggestion,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("template build error: {0}")]
    BuildArgv(#[from] seks_templates::BuildArgvError),
}

/// Map a template's own classification onto the same three-way lattice the
/// raw-command classifier uses, so both paths share one decision table.
fn template_tier(c: TemplateClassification) -> Classification {
    match c {
        TemplateClassification::Safe => Classification::Safe,
        TemplateClassification::Sensitive => Classification::Suspicious,
        TemplateClassification::Dangerous => Classification::Dangerous,
    }
}

pub fn evaluate(
    request: &ExecRequest,
    mode: PolicyMode,
    approval_provided: bool,
    templates: &TemplateRegistry,
) -> Result<PolicyDecision, PolicyError> {
    match request {
        ExecRequest::Template { template_id, params } => {
            let template = match templates.get(template_id) {
                Some(t) => t,
                None => {
                    return Ok(PolicyDecision::denied(
                        format!("unknown template: {template_id}"),
                        None,
                    ))
                }
            };

            if template.auto_approve && template.classification == TemplateClassification::Safe {
                let argv = templates.build_argv(&Invocation {
                    template_id: template_id.clone(),
                    params: params.clone(),
                })?;
                return Ok(PolicyDecision {
                    allowed: true,
                    mode: ResolutionMode::Template,
                    requires_approval: false,
                    argv: Some(argv),
                    reason: None,
                    suggestion: None,
                });
            }

            let tier = template_tier(template.classification);

            // dangerous template requests are denied in every mode, same as
            // arbitrary commands.
            if tier == Classification::Dangerous {
                return Ok(PolicyDecision::denied(
                    format!("template {template_id} classified dangerous"),
                    None,
                ));
            }

            let requires_approval = match mode {
                PolicyMode::Strict => true,
                PolicyMode::Moderate => template.classification != TemplateClassification::Safe,
                PolicyMode::Permissive => false,
            };

            if requires_approval && !approval_provided {
                return Ok(PolicyDecision {
                    allowed: false,
                    mode: ResolutionMode::Template,
                    requires_approval: true,
                    argv: None,
                    reason: Some(format!("template {template_id} requires approval")),
                    suggestion: None,
                });
            }

            let argv = templates.build_argv(&Invocation {
                template_id: template_id.clone(),
                params: params.clone(),
            })?;
            Ok(PolicyDecision {
                allowed: true,
                mode: ResolutionMode::Template,
                requires_approval: false,
                argv: Some(argv),
                reason: None,
                suggestion: None,
            })
        }
        ExecRequest::Arbitrary { command } => {
            if !mode.allow_arbitrary() {
                let suggestion = suggest_template(command, templates);
                return Ok(PolicyDecision::denied(
                    "arbitrary commands are not permitted in strict mode",
                    suggestion,
                ));
            }

            let tier = classify(command);
            match (mode, tier) {
                (_, Classification::Dangerous) => {
                    let suggestion = suggest_template(command, templates);
                    Ok(PolicyDecision::denied("command classified dangerous", suggestion))
                }
                (PolicyMode::Moderate, Classification::Suspicious) => Ok(PolicyDecision {
                    allowed: false,
                    mode: ResolutionMode::Allowlist,
                    requires_approval: true,
                    argv: None,
                    reason: Some("command classified suspicious".into()),
                    suggestion: suggest_template(command, templates),
                }),
                (PolicyMode::Permissive, Classification::Suspicious) | (_, Classification::Safe) => {
                    Ok(PolicyDecision {
                        allowed: true,
                        mode: ResolutionMode::Allowlist,
                        requires_approval: false,
                        argv: None,
                        reason: None,
                        suggestion: None,
                    })
                }
                (PolicyMode::Strict, _) => unreachable!("strict handled above"),
            }
        }
    }
}

/// Heuristic lookup used only to populate a deny-message suggestion. Never
/// affects the admit/deny decision itself.
fn suggest_template(command: &str, templates: &TemplateRegistry) -> Option<String> {
    let words: Vec<&str> = command.trim().split_whitespace().collect();
    if words.is_empty() {
        return None;
    }
    templates
        .list()
        .into_iter()
        .find(|t| {
            let literal_prefix: Vec<&str> = t
                .argv_pattern
                .iter()
                .take_while(|tok| !(tok.starts_with('{') && tok.ends_with('}')))
                .map(|s| s.as_str())
                .collect();
            !literal_prefix.is_empty() && words.starts_with(&literal_prefix)
        })
        .map(|t| t.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s2_strict_denies_arbitrary_and_suggests_template() {
        let templates = TemplateRegistry::with_builtins();
        let decision = evaluate(
            &ExecRequest::Arbitrary { command: "git status".into() },
            PolicyMode::Strict,
            false,
            &templates,
        )
        .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.suggestion.as_deref(), Some("git_status"));
    }

    #[test]
    fn moderate_allows_safe_arbitrary() {
        let templates = TemplateRegistry::with_builtins();
        let decision = evaluate(
            &ExecRequest::Arbitrary { command: "ls".into() },
            PolicyMode::Moderate,
            false,
            &templates,
        )
        .unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn moderate_requires_approval_for_suspicious() {
        let templates = TemplateRegistry::with_builtins();
        let decision = evaluate(
            &ExecRequest::Arbitrary { command: "python script.py".into() },
            PolicyMode::Moderate,
            false,
            &templates,
        )
        .unwrap();
        assert!(!decision.allowed);
        assert!(decision.requires_approval);
    }

    #[test]
    fn dangerous_is_denied_even_in_permissive() {
        let templates = TemplateRegistry::with_builtins();
        let decision = evaluate(
            &ExecRequest::Arbitrary { command: "rm -rf /".into() },
            PolicyMode::Permissive,
            true,
            &templates,
        )
        .unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn auto_approved_safe_template_needs_no_approval() {
        let templates = TemplateRegistry::with_builtins();
        let decision = evaluate(
            &ExecRequest::Template { template_id: "git_status".into(), params: HashMap::new() },
            PolicyMode::Strict,
            false,
            &templates,
        )
        .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.argv, Some(vec!["git".to_string(), "status".to_string()]));
    }

    #[test]
    fn sensitive_template_requires_approval_in_strict() {
        let templates = TemplateRegistry::with_builtins();
        let mut params = HashMap::new();
        params.insert("message".to_string(), "hi".to_string());
        let decision = evaluate(
            &ExecRequest::Template { template_id: "git_commit".into(), params },
            PolicyMode::Strict,
            false,
            &templates,
        )
        .unwrap();
        assert!(!decision.allowed);
        assert!(decision.requires_approval);
    }
}
