//! `load -> max_row -> times_x`, stored as JSON under `.cache/pipeline`.
//!
//! Run it twice: the second run loads every value instead of computing it.
//! Delete the directory to start over.

use lazygraph::{Graph, JsonBackend, json};

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    lazygraph::init_logging()?;

    let mut graph = Graph::named("pipeline");
    graph.add_backend("json", JsonBackend::json(".cache/pipeline")?, true)?;

    let load = graph
        .node(|_| Ok(json!([[1, 2, 3], [4, 5, 6], [9, 0, -1]])))
        .name("load")
        .build()?;

    let max_row = graph
        .node(|inputs| {
            let data: Vec<Vec<i64>> = inputs.parse("data")?;
            let max: Vec<i64> = data
                .iter()
                .filter_map(|row| row.iter().max().copied())
                .collect();
            Ok(json!(max))
        })
        .name("max_row")
        .kwarg("data", &load)
        .build()?;

    let times_x = graph
        .node(|inputs| {
            let data: Vec<i64> = inputs.parse("data")?;
            let x: i64 = inputs.parse("x")?;
            Ok(json!(data.iter().map(|d| d * x).collect::<Vec<_>>()))
        })
        .name("times_x")
        .kwarg("data", &max_row)
        .kwarg("x", json!(10))
        .build()?;

    println!("{}", times_x.evaluate()?);
    println!("{:?}", graph.evaluate_all(false)?);

    Ok(())
}
