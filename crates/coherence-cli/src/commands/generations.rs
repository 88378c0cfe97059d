use std::collections::BTreeMap;

use coherence_core::CoherenceConfig;

use super::Context;

pub fn init(config: &CoherenceConfig) -> anyhow::Result<()> {
    let ctx = Context::open(config)?;
    ctx.cache.ensure_schema()?;
    println!("✓ Generation table '{}' ready", ctx.cache.table().name());
    ctx.finish();
    Ok(())
}

pub fn list(config: &CoherenceConfig, format: &str) -> anyhow::Result<()> {
    let ctx = Context::open(config)?;
    let generations = ctx.cache.generations()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&to_json(&generations))?);
        }
        _ => {
            print!("{}", format_text(&generations));
        }
    }

    ctx.finish();
    Ok(())
}

pub fn invalidate(config: &CoherenceConfig, ids: &[String]) -> anyhow::Result<()> {
    let ctx = Context::open(config)?;
    for id in ids {
        let generation = ctx.cache.invalidate(id)?;
        println!("{id} → {generation}");
    }
    ctx.finish();
    Ok(())
}

fn to_json(generations: &BTreeMap<String, i64>) -> serde_json::Value {
    generations
        .iter()
        .map(|(id, generation)| serde_json::json!({ "id": id, "generation": generation }))
        .collect()
}

fn format_text(generations: &BTreeMap<String, i64>) -> String {
    if generations.is_empty() {
        return "no cache ids have been invalidated\n".to_string();
    }
    let width = generations.keys().map(String::len).max().unwrap_or(0);
    generations
        .iter()
        .map(|(id, generation)| format!("{id:<width$}  {generation}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<String, i64> {
        BTreeMap::from([
            ("WikiSystem.pages".to_string(), 3),
            ("Ticket.x".to_string(), 1),
        ])
    }

    #[test]
    fn text_output_is_aligned_and_sorted() {
        assert_eq!(
            format_text(&sample()),
            "Ticket.x          1\nWikiSystem.pages  3\n"
        );
    }

    #[test]
    fn text_output_for_empty_table() {
        assert!(format_text(&BTreeMap::new()).starts_with("no cache ids"));
    }

    #[test]
    fn json_output_lists_rows() {
        let json = to_json(&sample());
        assert_eq!(json[0]["id"], "Ticket.x");
        assert_eq!(json[1]["generation"], 3);
    }

    #[test]
    fn init_invalidate_list_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite:{}", dir.path().join("trac.db").display());
        let config = CoherenceConfig::for_database(&uri);

        init(&config).unwrap();
        invalidate(&config, &["WikiSystem.pages".to_string()]).unwrap();
        invalidate(&config, &["WikiSystem.pages".to_string()]).unwrap();

        let ctx = Context::open(&config).unwrap();
        assert_eq!(ctx.cache.generations().unwrap().get("WikiSystem.pages"), Some(&2));
        ctx.finish();
    }
}
