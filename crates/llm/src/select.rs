use serde::{Deserialize, Serialize};

use crate::role::{ApiKeys, ModelChoice, Role, fallback_chain};

/// Everything selection may look at. A persona override beats an explicit
/// role, which beats inference, which beats the `workhorse` default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub persona_role: Option<Role>,
    pub explicit_role: Option<Role>,
    pub offline: bool,
    pub has_large_files: bool,
    pub is_architect_task: bool,
    pub is_second_opinion: bool,
    pub estimated_tokens: Option<u32>,
}

/// The result of model selection: the role that won, the concrete choice, and
/// a short reason string for the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub role: Role,
    pub choice: ModelChoice,
    pub reason: String,
}

/// Tokens beyond which a request is considered deep-context work.
const DEEP_CONTEXT_TOKENS: u32 = 120_000;

/// Pure role inference from the criteria. No environment reads.
fn infer_role(criteria: &SelectionCriteria) -> (Role, &'static str) {
    if criteria.offline {
        return (Role::Local, "offline");
    }
    if criteria.is_architect_task {
        return (Role::Architect, "architect task");
    }
    if criteria.has_large_files
        || criteria
            .estimated_tokens
            .map(|t| t > DEEP_CONTEXT_TOKENS)
            .unwrap_or(false)
    {
        return (Role::DeepContext, "large context");
    }
    (Role::Workhorse, "default")
}

/// Select a concrete model for the given criteria.
///
/// Pure function of `(criteria, keys)`: walking the role's fallback chain,
/// the first entry whose provider has a key wins (`local` is exempt). A
/// second-opinion request skips the first keyed entry so the answer comes
/// from a different provider than the primary would.
pub fn select_model(criteria: &SelectionCriteria, keys: &ApiKeys) -> Option<Selection> {
    let (role, reason) = if let Some(role) = criteria.persona_role {
        (role, "persona override")
    } else if let Some(role) = criteria.explicit_role {
        (role, "explicit role")
    } else {
        infer_role(criteria)
    };

    let chain = fallback_chain(role);
    let mut keyed = chain.into_iter().filter(|c| keys.has(c.provider));

    let choice = if criteria.is_second_opinion {
        let first = keyed.next();
        keyed.next().or(first)
    } else {
        keyed.next()
    };

    choice.map(|choice| Selection {
        role,
        reason: format!("{reason}; {} via {}", choice.model, choice.provider.as_str()),
        choice,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Provider;

    fn all_keys() -> ApiKeys {
        ApiKeys::default()
            .with_key(Provider::Deepseek, "k")
            .with_key(Provider::Anthropic, "k")
            .with_key(Provider::Openai, "k")
            .with_key(Provider::Gemini, "k")
            .with_key(Provider::Xai, "k")
    }

    #[test]
    fn default_is_workhorse_first_keyed_entry() {
        let sel = select_model(&SelectionCriteria::default(), &all_keys()).unwrap();
        assert_eq!(sel.role, Role::Workhorse);
        assert_eq!(sel.choice.provider, Provider::Deepseek);
    }

    #[test]
    fn persona_override_beats_explicit_role() {
        let criteria = SelectionCriteria {
            persona_role: Some(Role::GuiFast),
            explicit_role: Some(Role::Architect),
            ..Default::default()
        };
        let sel = select_model(&criteria, &all_keys()).unwrap();
        assert_eq!(sel.role, Role::GuiFast);
    }

    #[test]
    fn offline_infers_local_with_no_keys() {
        let criteria = SelectionCriteria {
            offline: true,
            ..Default::default()
        };
        let sel = select_model(&criteria, &ApiKeys::default()).unwrap();
        assert_eq!(sel.role, Role::Local);
        assert_eq!(sel.choice.provider, Provider::Local);
    }

    #[test]
    fn missing_keys_skip_to_next_chain_entry() {
        let keys = ApiKeys::default().with_key(Provider::Gemini, "k");
        let sel = select_model(&SelectionCriteria::default(), &keys).unwrap();
        assert_eq!(sel.choice.provider, Provider::Gemini);
    }

    #[test]
    fn large_estimated_tokens_infer_deep_context() {
        let criteria = SelectionCriteria {
            estimated_tokens: Some(200_000),
            ..Default::default()
        };
        let sel = select_model(&criteria, &all_keys()).unwrap();
        assert_eq!(sel.role, Role::DeepContext);
    }

    #[test]
    fn second_opinion_picks_a_different_provider() {
        let primary = select_model(&SelectionCriteria::default(), &all_keys()).unwrap();
        let second = select_model(
            &SelectionCriteria {
                is_second_opinion: true,
                ..Default::default()
            },
            &all_keys(),
        )
        .unwrap();
        assert_ne!(primary.choice.provider, second.choice.provider);
    }

    #[test]
    fn selection_is_deterministic() {
        let criteria = SelectionCriteria {
            is_architect_task: true,
            ..Default::default()
        };
        let keys = all_keys();
        let a = select_model(&criteria, &keys).unwrap();
        let b = select_model(&criteria, &keys).unwrap();
        assert_eq!(a.choice, b.choice);
        assert_eq!(a.role, b.role);
    }

    #[test]
    fn no_keyed_provider_yields_none_for_keyless_role() {
        // Architect chain has no local entry, so with zero keys there is no pick.
        let criteria = SelectionCriteria {
            explicit_role: Some(Role::Architect),
            ..Default::default()
        };
        assert!(select_model(&criteria, &ApiKeys::default()).is_none());
    }
}
