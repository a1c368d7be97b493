//! Prompt assembly for the travel assistant.
//!
//! Turns stored conversation history plus a new user message into an
//! [`LlmRequest`], with the fixed system instruction that defines the
//! assistant's persona and output format.

use crate::conversation::{Message, MessageRole};
use crate::error::ApiError;
use crate::llm::{LlmRequest, Turn, TurnRole};

/// System instruction sent with every model request.
pub const SYSTEM_INSTRUCTION: &str = "\
You are Wayfinder, an expert travel-planning assistant. You help people plan \
trips end to end: destinations, day-by-day itineraries, budgets and cost-saving \
tips, flights and accommodation, food, local transport, packing, weather and \
the best seasons to visit, visas and documentation, safety, and cultural \
etiquette.

Format every response in Markdown:
- Use ## headers to organize longer answers, for example by day or by topic.
- Use bullet lists for options and tips, and numbered lists for step-by-step plans.
- Use tables to compare destinations, costs, or schedules.
- Use **bold** for names, places, and key figures.
- Use > blockquotes for tips and warnings worth remembering.

Be warm, practical, and specific. Remember context from earlier in the \
conversation. When a request is missing something essential such as dates, \
budget, or a starting point, ask one short clarifying question; otherwise \
answer directly with concrete recommendations.";

/// Reject a user message that is empty or whitespace-only.
///
/// # Errors
///
/// [`ApiError::EmptyMessage`] when the message contains no visible text.
pub fn validate(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    Ok(())
}

/// Assemble the model request for a conversation and a new user message.
///
/// Prior messages keep their stored order, with the stored `assistant` role
/// mapped to the provider's `model` label; the new message becomes the final
/// `user` turn. The conversation itself is not mutated.
#[must_use]
pub fn assemble(history: &[Message], content: &str) -> LlmRequest {
    let mut turns: Vec<Turn> = history
        .iter()
        .map(|message| Turn {
            role: match message.role {
                MessageRole::User => TurnRole::User,
                MessageRole::Assistant => TurnRole::Model,
            },
            text: message.content.clone(),
        })
        .collect();

    turns.push(Turn {
        role: TurnRole::User,
        text: content.to_string(),
    });

    LlmRequest {
        system_instruction: SYSTEM_INSTRUCTION.to_string(),
        turns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_blank_messages() {
        assert!(matches!(validate(""), Err(ApiError::EmptyMessage)));
        assert!(matches!(validate("   "), Err(ApiError::EmptyMessage)));
        assert!(matches!(validate("\n\t"), Err(ApiError::EmptyMessage)));
        assert!(validate("Plan a trip").is_ok());
    }

    #[test]
    fn test_assemble_empty_history() {
        let request = assemble(&[], "Plan a 3-day Tokyo trip");

        assert_eq!(request.system_instruction, SYSTEM_INSTRUCTION);
        assert_eq!(
            request.turns,
            vec![Turn {
                role: TurnRole::User,
                text: "Plan a 3-day Tokyo trip".to_string(),
            }]
        );
    }

    #[test]
    fn test_assemble_maps_roles_and_appends_last() {
        let history = vec![
            Message::user("Where should I go in April?"),
            Message::assistant("Kyoto is lovely in April."),
        ];

        let request = assemble(&history, "How do I get there from Tokyo?");

        assert_eq!(request.turns.len(), 3);
        assert_eq!(request.turns[0].role, TurnRole::User);
        assert_eq!(request.turns[1].role, TurnRole::Model);
        assert_eq!(request.turns[1].text, "Kyoto is lovely in April.");
        assert_eq!(request.turns[2].role, TurnRole::User);
        assert_eq!(request.turns[2].text, "How do I get there from Tokyo?");
    }
}
