//! Generation request construction.
//!
//! The request is two messages: a fixed system message (role, rules,
//! deliverables, output format, reference sample) and a per-product user
//! message carrying the identity and the resolved specifications.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use partgen_ollama::ChatMessage;
use partgen_shared::SpecMap;

/// Instructions shared by every product.
pub const SYSTEM_PROMPT: &str = "\
# Role
You are an expert website content manager writing product titles and descriptions \
for essentialparts.com, an electrical ecommerce site. Your readers are electrical \
contractors, resellers and facility engineers buying for commercial and industrial \
projects. Write consistent, SEO-optimized, uniquely detailed content for each part.

# Rules
1. Analyze the part number for clues about product type, rating, size, poles and features.
2. Interpret it using the manufacturer's own part-number conventions.
3. Do not invent features the part number or the provided specifications do not support. \
If a detail cannot be inferred, leave it out.
4. When specifications are provided, treat them as authoritative and work them naturally \
into the copy.
5. Never reuse generic template phrasing; every description must be specific to its part.
6. Use precise industry terminology: ratings, certifications (UL, CSA), NEMA or IP \
enclosure ratings, mounting and connection types where applicable.

# Deliverables
1. Technical description: formal, technical, natural-language prose (no bullet points, \
no numbered features), close to 2000 characters, covering purpose, applications, \
specifications and industry relevance, written as a technical marketing professional would.
2. SEO title in the format: [Part Number] – [Manufacturer] [Key Specifications] [Product Type]
   - 80 characters or less, counting spaces and punctuation.
   - Always include part number, manufacturer and product type; add the most important \
specs that fit.
   - Prefer abbreviations: amperes → A (100A), volts → V (600V), 2 pole → 2P, 3 pole → 3P.

# Output Format
Start directly with the title. No introduction, notes or explanations.

Title: [SEO Title]
Description: [Technical Description]

# Reference Sample
Title: HDA36100 - Square D 100 Amp 600V 3 Pole Circuit Breaker
Description:
The Square D HDA36100 molded case circuit breaker is a trusted solution for commercial and \
industrial electrical systems. With a 100 amp rating, 600V maximum capacity, and 3-pole \
configuration, this breaker is built for dependable protection and long-term performance.
Part of the Square D PowerPact H-Series, the HDA36100 features a thermal-magnetic trip unit, \
durable molded case, and bolt-on connections that simplify panel installation. Its compact \
design makes it a perfect fit for new installations, replacements, or retrofits in \
high-demand environments.
Electricians, contractors, and facility managers rely on Square D for quality, and at \
Essential Parts we deliver the products you need fast. All breakers are in stock, tested, \
and backed by expert support.
Buy the HDA36100 today and keep your power systems protected and code-compliant.

For the same part number and manufacturer, produce the same output every time.";

/// Render specifications as literal `- label: value` lines.
pub fn render_specs(specs: &SpecMap) -> String {
    let mut out = String::new();
    for (label, value) in specs.iter() {
        let _ = writeln!(out, "- {label}: {value}");
    }
    out
}

/// Build the per-product user message.
pub fn user_prompt(part_number: &str, manufacturer: &str, specs: &SpecMap) -> String {
    let mut out = format!("# Inputs\nPart Number: {part_number}\nManufacturer: {manufacturer}\n");
    if !specs.is_empty() {
        out.push_str("\n# Product Specifications\n");
        out.push_str(&render_specs(specs));
    }
    out
}

/// The full conversation sent for one product.
pub fn build_messages(part_number: &str, manufacturer: &str, specs: &SpecMap) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_prompt(part_number, manufacturer, specs)),
    ]
}

/// SHA-256 over every message's role and content.
///
/// Two requests with equal fingerprints sent identical text; whether the
/// service answered identically is a separate question.
pub fn prompt_fingerprint(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use partgen_ollama::Role;

    use super::*;

    fn specs() -> SpecMap {
        let mut specs = SpecMap::new();
        specs.insert("Voltage", "600V");
        specs.insert("Poles", "3");
        specs
    }

    #[test]
    fn specs_rendered_as_literal_lines() {
        assert_eq!(render_specs(&specs()), "- Voltage: 600V\n- Poles: 3\n");
    }

    #[test]
    fn user_prompt_carries_identity_and_specs() {
        let prompt = user_prompt("HDA36100", "Square D", &specs());
        assert!(prompt.contains("Part Number: HDA36100"));
        assert!(prompt.contains("Manufacturer: Square D"));
        assert!(prompt.contains("- Voltage: 600V"));
    }

    #[test]
    fn user_prompt_without_specs_has_no_section() {
        let prompt = user_prompt("X100", "Acme", &SpecMap::new());
        assert!(!prompt.contains("Specifications"));
    }

    #[test]
    fn messages_are_system_then_user() {
        let messages = build_messages("X100", "Acme", &SpecMap::new());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
        assert!(messages[0].content.contains("Title:"));
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let a = build_messages("X100", "Acme", &specs());
        let b = build_messages("X100", "Acme", &specs());
        let c = build_messages("X101", "Acme", &specs());
        assert_eq!(prompt_fingerprint(&a), prompt_fingerprint(&b));
        assert_ne!(prompt_fingerprint(&a), prompt_fingerprint(&c));
        assert_eq!(prompt_fingerprint(&a).len(), 64);
    }
}
