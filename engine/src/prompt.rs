//! Prompt construction for chat requests.

use loragate_model_cache::TokenizerProfile;
use loragate_values::Message;
use minijinja::{context, Environment};
use tracing::warn;

/// Render the chat template with a generation cue. A failing template falls
/// back to plain `role: content` concatenation.
pub fn build_chat_prompt(profile: &TokenizerProfile, messages: &[Message]) -> String {
    match render_chat_template(
        &profile.chat_template,
        messages,
        profile.bos_token.as_deref(),
        profile.eos_token.as_deref(),
    ) {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!(error = %e, "chat template failed, using fallback");
            fallback_prompt(messages)
        }
    }
}

fn render_chat_template(
    template: &str,
    messages: &[Message],
    bos_token: Option<&str>,
    eos_token: Option<&str>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("chat", template)?;
    env.get_template("chat")?.render(context! {
        messages => messages,
        add_generation_prompt => true,
        bos_token => bos_token.unwrap_or(""),
        eos_token => eos_token.unwrap_or(""),
    })
}

/// Plain concatenation used when no template renders.
pub fn fallback_prompt(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&message.role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}
