//! CSV reports of budget sweeps and Pareto frontiers.

use std::{fs::File, path::Path};

use anyhow::{Context, Result};
use csv::WriterBuilder;
use optimizer::{Assignment, Candidate, InfeasibleError, ProfileGraph, Selection};
use serde::Serialize;

/// One line of a report. Empty cells are infeasible budgets.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportRow {
    pub budget: Option<f64>,
    pub status: String,
    pub weighted_accuracy: Option<f64>,
    pub total_cost: Option<f64>,
    pub assignment: String,
    pub exhaustive: Option<bool>,
    pub candidates_evaluated: Option<u64>,
}

fn describe(graph: &ProfileGraph, assignment: &Assignment) -> String {
    assignment
        .describe(graph)
        .into_iter()
        .map(|(stage, variant)| format!("{stage}={variant}"))
        .collect::<Vec<_>>()
        .join(";")
}

#[derive(Debug, Default)]
pub struct SweepReport {
    rows: Vec<ReportRow>,
}

impl SweepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn push_selection(
        &mut self,
        graph: &ProfileGraph,
        budget: f64,
        result: &Result<Selection, InfeasibleError>,
    ) {
        let row = match result {
            Ok(selection) => ReportRow {
                budget: Some(budget),
                status: "ok".to_string(),
                weighted_accuracy: Some(selection.weighted_accuracy),
                total_cost: Some(selection.total_cost),
                assignment: describe(graph, &selection.assignment),
                exhaustive: Some(selection.exhaustive),
                candidates_evaluated: Some(selection.candidates_evaluated),
            },
            Err(err) => ReportRow {
                budget: Some(budget),
                status: match err {
                    InfeasibleError::Budget { .. } => "over_budget",
                    InfeasibleError::AccuracyFloor { .. } => "below_floor",
                    InfeasibleError::Unprofiled { .. } => "unprofiled",
                }
                .to_string(),
                weighted_accuracy: None,
                total_cost: None,
                assignment: String::new(),
                exhaustive: None,
                candidates_evaluated: None,
            },
        };
        self.rows.push(row);
    }

    pub fn push_frontier(&mut self, graph: &ProfileGraph, frontier: &[Candidate]) {
        self.rows.extend(frontier.iter().map(|c| ReportRow {
            budget: None,
            status: "frontier".to_string(),
            weighted_accuracy: Some(c.score),
            total_cost: Some(c.cost),
            assignment: describe(graph, &c.assignment),
            exhaustive: Some(true),
            candidates_evaluated: None,
        }));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
        for row in &self.rows {
            writer.serialize(row).context("writing report row")?;
        }
        writer.flush().context("flushing report")?;
        Ok(())
    }
}
