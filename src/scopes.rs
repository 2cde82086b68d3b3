//! Scope requirements of features and how a task's scopes satisfy them.
//!
//! A [`ScopeExpression`] is a disjunction of conjunctions: it is satisfied
//! when every scope of at least one alternative is granted. A granted scope
//! ending in `*` grants every scope with that prefix.

use crate::error::Result;
use crate::queue::Authorizer;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeExpression {
    alternatives: Vec<Vec<String>>,
}

impl ScopeExpression {
    /// Requires nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all_of(scopes: Vec<String>) -> Self {
        if scopes.is_empty() {
            return Self::none();
        }
        Self {
            alternatives: vec![scopes],
        }
    }

    pub fn any_of(alternatives: Vec<Vec<String>>) -> Self {
        Self { alternatives }
    }

    pub fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// Literal check against `given`, without role expansion.
    pub fn satisfied_by(&self, given: &[String]) -> bool {
        if self.is_empty() {
            return true;
        }
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|required| grants(given, required)))
    }
}

impl std::fmt::Display for ScopeExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let alternatives: Vec<String> = self
            .alternatives
            .iter()
            .map(|all| format!("[{}]", all.join(", ")))
            .collect();
        write!(f, "{}", alternatives.join(" or "))
    }
}

fn grants(given: &[String], required: &str) -> bool {
    given.iter().any(|scope| match scope.strip_suffix('*') {
        Some(prefix) => required.starts_with(prefix),
        None => scope == required,
    })
}

/// Check `required` against `given`, expanding `assume:` scopes through the
/// authorizer only when the literal check fails.
pub async fn satisfied(
    required: &ScopeExpression,
    given: &[String],
    authorizer: &dyn Authorizer,
) -> Result<bool> {
    if required.satisfied_by(given) {
        return Ok(true);
    }
    if !given.iter().any(|s| s.starts_with("assume:")) {
        return Ok(false);
    }
    let expanded = authorizer.expand_scopes(given).await?;
    Ok(required.satisfied_by(&expanded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StaticAuthorizer;

    fn scopes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_expression_is_always_satisfied() {
        assert!(ScopeExpression::none().satisfied_by(&[]));
        assert!(ScopeExpression::all_of(vec![]).is_empty());
    }

    #[test]
    fn conjunction_needs_every_scope() {
        let expr = ScopeExpression::all_of(scopes(&["a", "b"]));
        assert!(expr.satisfied_by(&scopes(&["a", "b", "c"])));
        assert!(!expr.satisfied_by(&scopes(&["a"])));
    }

    #[test]
    fn disjunction_needs_one_alternative() {
        let expr = ScopeExpression::any_of(vec![scopes(&["a", "b"]), scopes(&["c"])]);
        assert!(expr.satisfied_by(&scopes(&["c"])));
        assert!(!expr.satisfied_by(&scopes(&["a"])));
    }

    #[test]
    fn trailing_star_grants_prefix() {
        let expr = ScopeExpression::all_of(scopes(&["fleet-worker:os-group:p/w/docker"]));
        assert!(expr.satisfied_by(&scopes(&["fleet-worker:os-group:p/w/*"])));
        assert!(expr.satisfied_by(&scopes(&["*"])));
        assert!(!expr.satisfied_by(&scopes(&["fleet-worker:os-group:p/x/*"])));
    }

    #[test]
    fn display_lists_alternatives() {
        let expr = ScopeExpression::any_of(vec![scopes(&["a", "b"]), scopes(&["c"])]);
        assert_eq!(expr.to_string(), "[a, b] or [c]");
    }

    #[tokio::test]
    async fn assume_scopes_are_expanded_when_needed() {
        let auth = StaticAuthorizer::new().with_role("project:ci", scopes(&["secret:*"]));
        let expr = ScopeExpression::all_of(scopes(&["secret:token"]));
        assert!(satisfied(&expr, &scopes(&["assume:project:ci"]), &auth)
            .await
            .unwrap());
        assert!(!satisfied(&expr, &scopes(&["other"]), &auth).await.unwrap());
    }

    #[tokio::test]
    async fn literal_match_skips_authorizer() {
        let auth = StaticAuthorizer::new();
        auth.set_unavailable(true);
        let expr = ScopeExpression::all_of(scopes(&["a"]));
        assert!(satisfied(&expr, &scopes(&["a", "assume:x"]), &auth)
            .await
            .unwrap());
        assert!(satisfied(&expr, &scopes(&["assume:x"]), &auth).await.is_err());
    }
}
