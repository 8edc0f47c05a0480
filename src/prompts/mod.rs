use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

// NOTE:
// Marker literals live only on `PromptTemplate::markers`. Extraction reads them
// back from the rendered `Prompt`, never from its own copies.

const INSTRUCTION_PERSONA: &str = "\
You are an AI assistant powering the chatbot for Ubayog.com, a platform for searching, \
listing, and renting various assets. Your primary role is to create a seamless \
conversational experience that helps users find assets, list their own items, and \
navigate the platform efficiently.

## Core Capabilities

1. SEARCH FUNCTIONALITY:
   - Understand natural language queries about available assets
   - Interpret search parameters including asset type, price range, location, and availability
   - Respond with relevant, organized search results
   - Help users refine their search when needed
   - Suggest similar or alternative options when exact matches aren't available

2. LISTING ASSISTANCE:
   - Guide users through the asset listing process step-by-step
   - Request essential information (asset details, specifications, pricing, availability)
   - Provide suggestions for optimal pricing based on similar listings
   - Confirm listing details before submission
   - Explain the listing review process and expected timeline

3. PLATFORM INFORMATION:
   - Answer FAQs about Ubayog's services, fees, and policies
   - Explain the rewards program and its benefits
   - Provide guidance on platform usage
   - Direct users to relevant resources when appropriate

## Conversation Style

- Be helpful, friendly, and concise
- Use natural conversational language
- Provide clear options for next steps
- Confirm understanding before proceeding with complex tasks

## Answer Format

For search queries:
- Confirm search parameters
- Present top 3-5 matching results
- Include key details for each (name, price, location, availability)
- Offer options to refine search or view more details

For listing requests:
- Follow a structured conversation flow requesting specific details
- Confirm information at each step
- Explain next steps after submission

For information requests:
- Provide direct, accurate answers
- Include relevant policy details
- Offer follow-up assistance if needed

Always maintain a helpful, solutions-oriented approach and focus on helping users \
accomplish their goals on the Ubayog platform efficiently.";

const DIALOGUE_PERSONA: &str = "\
The following is a conversation with the Ubayog.com rental assistant. The assistant \
helps people search for assets to rent, list their own items, and understand the \
platform. It is helpful, friendly, and concise.";

/// Delimiters separating the user turn from the expected continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markers {
    pub user: &'static str,
    pub response: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    /// Long-form persona followed by `### User Input:` / `### Response:` sections.
    #[default]
    Instruction,
    /// Short persona followed by a `User:` / `Assistant:` exchange.
    Dialogue,
}

impl PromptTemplate {
    pub fn markers(self) -> Markers {
        match self {
            PromptTemplate::Instruction => Markers {
                user: "### User Input:",
                response: "### Response:",
            },
            PromptTemplate::Dialogue => Markers {
                user: "User:",
                response: "Assistant:",
            },
        }
    }

    pub fn persona(self) -> &'static str {
        match self {
            PromptTemplate::Instruction => INSTRUCTION_PERSONA,
            PromptTemplate::Dialogue => DIALOGUE_PERSONA,
        }
    }

    fn render(self, message: &str) -> String {
        let markers = self.markers();
        match self {
            PromptTemplate::Instruction => format!(
                "{persona}\n\n{user}\n{message}\n\n{response}\n",
                persona = self.persona(),
                user = markers.user,
                response = markers.response,
            ),
            PromptTemplate::Dialogue => format!(
                "{persona}\n\n{user} {message}\n{response}",
                persona = self.persona(),
                user = markers.user,
                response = markers.response,
            ),
        }
    }
}

impl FromStr for PromptTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instruction" => Ok(PromptTemplate::Instruction),
            "dialogue" => Ok(PromptTemplate::Dialogue),
            other => Err(anyhow!(
                "unknown prompt template `{other}` (expected `instruction` or `dialogue`)"
            )),
        }
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptTemplate::Instruction => f.write_str("instruction"),
            PromptTemplate::Dialogue => f.write_str("dialogue"),
        }
    }
}

/// Fully rendered model input. Carries the markers it was rendered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    text: String,
    markers: Markers,
}

impl Prompt {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn markers(&self) -> Markers {
        self.markers
    }
}

pub fn build_prompt(template: PromptTemplate, message: &str) -> Prompt {
    Prompt {
        text: template.render(message),
        markers: template.markers(),
    }
}
