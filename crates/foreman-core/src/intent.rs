use foreman_types::RunIntent;

/// Policy knobs derived from the classified intent. The loop consumes these
/// as configuration; the classifier itself never steers control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentPolicy {
    pub intent: RunIntent,
    pub iteration_budget: u64,
    /// Whether the read-only iteration ceiling may halt this run. Diagnostic
    /// requests legitimately never mutate, so the ceiling does not apply.
    pub read_only_ceiling_applies: bool,
    /// Whether the loop should bias the engine toward mutating tools when
    /// reads happen but no mutation has landed by iteration 2.
    pub expects_mutation: bool,
}

pub fn policy_for_intent(intent: RunIntent) -> IntentPolicy {
    match intent {
        RunIntent::Fix => IntentPolicy {
            intent,
            iteration_budget: 25,
            read_only_ceiling_applies: true,
            expects_mutation: true,
        },
        RunIntent::Build => IntentPolicy {
            intent,
            iteration_budget: 40,
            read_only_ceiling_applies: true,
            expects_mutation: true,
        },
        RunIntent::Diagnose => IntentPolicy {
            intent,
            iteration_budget: 20,
            read_only_ceiling_applies: false,
            expects_mutation: false,
        },
        RunIntent::Question => IntentPolicy {
            intent,
            iteration_budget: 8,
            read_only_ceiling_applies: false,
            expects_mutation: false,
        },
        RunIntent::General => IntentPolicy {
            intent,
            iteration_budget: 15,
            read_only_ceiling_applies: true,
            expects_mutation: false,
        },
    }
}

/// Keyword scorer over the request text. Pluggable: deployments can swap
/// this for a model-backed classifier as long as it returns the same enum.
pub fn classify_intent(request: &str) -> RunIntent {
    let lower = request.to_lowercase();

    let fix_score = score(&lower, &["fix", "repair", "patch", "resolve", "bug", "broken", "crash", "error in"]);
    let build_score = score(
        &lower,
        &["build", "implement", "create", "add ", "write a", "refactor", "rename", "migrate"],
    );
    let diagnose_score = score(
        &lower,
        &["investigate", "why", "diagnose", "debug", "look into", "check if", "what is causing", "analyze"],
    );
    let question_score = score(
        &lower,
        &["how do", "what does", "explain", "where is", "which", "?"],
    );

    let best = [
        (RunIntent::Fix, fix_score),
        (RunIntent::Build, build_score),
        (RunIntent::Diagnose, diagnose_score),
        (RunIntent::Question, question_score),
    ]
    .into_iter()
    .max_by_key(|(_, score)| *score)
    .unwrap_or((RunIntent::General, 0));

    match best {
        (_, 0) => RunIntent::General,
        // A question mark alone never outranks an action verb.
        (RunIntent::Question, score) if score == 1 && (fix_score > 0 || build_score > 0) => {
            if fix_score >= build_score {
                RunIntent::Fix
            } else {
                RunIntent::Build
            }
        }
        (intent, _) => intent,
    }
}

fn score(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(*kw)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_requests_classify_as_fix() {
        assert_eq!(
            classify_intent("fix the null pointer in module X"),
            RunIntent::Fix
        );
        assert_eq!(classify_intent("repair the broken login flow"), RunIntent::Fix);
    }

    #[test]
    fn diagnostic_requests_escape_the_readonly_ceiling() {
        let intent = classify_intent("investigate why logins fail");
        assert_eq!(intent, RunIntent::Diagnose);
        let policy = policy_for_intent(intent);
        assert!(!policy.read_only_ceiling_applies);
        assert!(!policy.expects_mutation);
    }

    #[test]
    fn build_requests_expect_mutation() {
        let policy = policy_for_intent(classify_intent("implement a retry helper"));
        assert_eq!(policy.intent, RunIntent::Build);
        assert!(policy.expects_mutation);
    }

    #[test]
    fn unmatched_text_defaults_to_general() {
        let policy = policy_for_intent(classify_intent("hello there"));
        assert_eq!(policy.intent, RunIntent::General);
        assert!(policy.read_only_ceiling_applies);
    }

    #[test]
    fn trailing_question_mark_does_not_outrank_fix_verb() {
        assert_eq!(
            classify_intent("can you fix the crash in the parser?"),
            RunIntent::Fix
        );
    }
}
