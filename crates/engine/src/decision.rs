//! Decision keyword detection
//!
//! Summarizing chat state after every turn would be wasteful, so the
//! summarize call is gated on the exchange actually containing a
//! decision. Detection is plain lowercase substring matching: a text
//! counts when it contains a decision keyword and no negative keyword.
//! Query and answer are checked independently; either one passing
//! opens the gate.

pub struct DecisionDetector {
    decision_keywords: Vec<String>,
    negative_keywords: Vec<String>,
}

impl DecisionDetector {
    pub fn new(decision_keywords: &[String], negative_keywords: &[String]) -> Self {
        Self {
            decision_keywords: lowercase_all(decision_keywords),
            negative_keywords: lowercase_all(negative_keywords),
        }
    }

    /// Whether this exchange should refresh the chat summary
    pub fn detect(&self, query: &str, answer: &str) -> bool {
        self.matches(query) || self.matches(answer)
    }

    fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        if self.negative_keywords.iter().any(|kw| text.contains(kw)) {
            return false;
        }
        self.decision_keywords.iter().any(|kw| text.contains(kw))
    }
}

fn lowercase_all(keywords: &[String]) -> Vec<String> {
    keywords.iter().map(|kw| kw.to_lowercase()).collect()
}
