//! Logging glue (spec section 4.11 / 6): renders every event as
//! `<LEVEL>: <message>`, with `WARN`/`ERROR` routed to stderr and
//! `INFO`/`DEBUG` to stdout, matching the original extension's log format.

use std::io;

use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `<LEVEL>: <message>` event formatter, no timestamp or target — the
/// teacher's `fmt::layer()` default is a structured multi-field line, but
/// the spec's log format is this single plain line.
struct PlainFormat;

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "{}: ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Routes `WARN`/`ERROR` events to stderr and everything else to stdout.
#[derive(Clone, Copy, Default)]
struct LevelRoutedWriter;

impl<'a> MakeWriter<'a> for LevelRoutedWriter {
    type Writer = Box<dyn io::Write>;

    fn make_writer(&'a self) -> Self::Writer {
        Box::new(io::stdout())
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        if meta.level() <= &Level::WARN {
            Box::new(io::stderr())
        } else {
            Box::new(io::stdout())
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` (falling back to `info` with
/// `sqlx` quieted to `warn`, mirroring the teacher's default filter
/// directive) controls whether `DEBUG` lines are emitted at all.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(PlainFormat)
                .with_writer(LevelRoutedWriter)
                .with_ansi(false),
        )
        .init();
}
