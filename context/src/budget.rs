use serde::Serialize;

/// Split of a model's context window.
///
/// `available` is what remains for history and the new message once the
/// response reservation, system prompt and tool descriptions are paid for.
/// All arithmetic saturates: an oversized prompt yields zero, never wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    pub max_tokens: u32,
    pub reserved_for_response: u32,
    pub system_prompt: u32,
    pub tools: u32,
    pub available: u32,
}

impl TokenBudget {
    #[must_use]
    pub fn compute(
        max_tokens: u32,
        reserved_for_response: u32,
        system_prompt: u32,
        tools: u32,
    ) -> Self {
        let available = max_tokens
            .saturating_sub(reserved_for_response)
            .saturating_sub(system_prompt)
            .saturating_sub(tools);
        Self {
            max_tokens,
            reserved_for_response,
            system_prompt,
            tools,
            available,
        }
    }

    /// Ceiling for everything sent: prompt, tools and messages.
    #[must_use]
    pub fn input_cap(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reserved_for_response)
    }
}
