//! Local reply used when every chat endpoint has failed.

const NOTICE: &str = "I can't reach the analysis service right now, so here is some general guidance while it recovers.";

const CLOSING: &str = "Try your question again in a minute for a full analysis of your sites.";

/// Topic keywords and the guidance shown for them, checked in order.
const TOPICS: &[(&[&str], &str)] = &[
    (
        &["price", "value", "valuation", "comp", "appraisal"],
        "For valuation, start from three to five recent comparable sales within a mile, \
         adjust for size, age and condition, and weigh price per square foot against \
         the local median rather than the listing price.",
    ),
    (
        &["zoning", "permit", "setback", "density", "entitle"],
        "For zoning questions, check the parcel's base district and any overlays, confirm \
         allowed uses and maximum density, and review setback and height limits before \
         estimating buildable area.",
    ),
    (
        &["rent", "yield", "cap rate", "noi", "cash flow", "income"],
        "For income properties, compare net operating income to purchase price for the cap \
         rate, stress-test vacancy at 5 to 10 percent, and budget reserves for capital \
         expenditures before judging cash flow.",
    ),
    (
        &["market", "trend", "demand", "inventory", "absorption"],
        "For market trends, track months of inventory, days on market and absorption over \
         the last two to four quarters; a falling inventory with rising absorption usually \
         signals a tightening market.",
    ),
    (
        &["site", "parcel", "lot", "acre", "location"],
        "For site selection, screen parcels on access and frontage, utilities, flood zone \
         and topography first, then rank the survivors on demographics and traffic counts.",
    ),
];

const GENERAL: &str = "Useful starting points are recent comparable sales, the parcel's zoning \
     and permitted uses, local supply and demand indicators, and a simple income or cost \
     approach to value.";

/// Build the emergency assistant reply for `user_text`.
pub fn emergency_reply(user_text: &str) -> String {
    let lowered = user_text.to_lowercase();
    let guidance: Vec<&str> = TOPICS
        .iter()
        .filter(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, text)| *text)
        .collect();

    let body = if guidance.is_empty() {
        GENERAL.to_string()
    } else {
        guidance.join("\n\n")
    };
    format!("{NOTICE}\n\n{body}\n\n{CLOSING}")
}
