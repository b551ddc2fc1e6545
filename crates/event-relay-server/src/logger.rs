// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for the relay binary:
//!
//! ```text
//! EVENT_RELAY | LEVEL | component | [span{fields}: ]message fields
//! ```
//!
//! `component` is the relay module that logged, such as `flusher` or
//! `intake`. Events from other crates show their full target instead.

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

const RELAY_TARGETS: [&str; 2] = ["event_relay", "event_relay_server"];

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

fn component(target: &str) -> &str {
    let crate_name = target.split("::").next().unwrap_or(target);
    if RELAY_TARGETS.contains(&crate_name) {
        target.rsplit("::").next().unwrap_or(target)
    } else {
        target
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "EVENT_RELAY | {} | {} | ",
            metadata.level(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
