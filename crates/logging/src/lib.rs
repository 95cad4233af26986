//! # Overview
//!
//! Leveled, component-tagged log initialization for privleapd, wrapping
//! `tracing`/`tracing-subscriber` behind the small surface the daemon
//! actually needs: [`init`] to install the subscriber once at startup,
//! and the [`critical!`] macro for the one severity `tracing` has no
//! built-in level for.
//!
//! # Design
//!
//! Every log line renders as `<component>: <SEVERITY>: <message>`, where
//! `<component>` is the `target` of the tracing event (set via the
//! ordinary module path unless overridden) and `<SEVERITY>` is one of
//! `INFO`, `WARNING`, `ERROR`, `CRITICAL`. `tracing` has no `WARNING`
//! level (it spells it `WARN`) and no `CRITICAL` level at all, so the
//! formatter in this crate renders `Level::WARN` as `WARNING` and
//! synthesizes `CRITICAL` from an `ERROR`-level event carrying a
//! `critical = true` field, rather than inventing a fifth `tracing`
//! level.
//!
//! # Examples
//!
//! ```
//! privleap_logging::init(true);
//! tracing::info!(target: "supervisor", "state directory ready");
//! privleap_logging::critical!(target: "supervisor", "another instance is running");
//! ```
//!
//! # See also
//!
//! `privleap-daemon::error` for how each error enum maps to one of these
//! severities.

use std::fmt;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Installs the global `tracing` subscriber with privleapd's formatter.
///
/// `test_mode` widens the minimum level to `DEBUG`; normal operation logs
/// at `INFO` and above. Safe to call more than once — subsequent calls
/// are no-ops (mirrors `tracing`'s own `set_global_default` semantics,
/// which errors if a subscriber is already installed; that error is
/// swallowed here since re-initialization is not a startup failure).
pub fn init(test_mode: bool) {
    let filter = if test_mode {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .event_format(ComponentSeverityFormat)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Renders one event as `<component>: <SEVERITY>: <message>`.
struct ComponentSeverityFormat;

impl<S, N> FormatEvent<S, N> for ComponentSeverityFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut visitor = CriticalFieldVisitor::default();
        event.record(&mut visitor);

        let severity = if visitor.critical {
            "CRITICAL"
        } else {
            match *metadata.level() {
                tracing::Level::ERROR => "ERROR",
                tracing::Level::WARN => "WARNING",
                tracing::Level::INFO => "INFO",
                tracing::Level::DEBUG | tracing::Level::TRACE => "DEBUG",
            }
        };

        write!(writer, "{}: {}: ", metadata.target(), severity)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[derive(Default)]
struct CriticalFieldVisitor {
    critical: bool,
}

impl tracing::field::Visit for CriticalFieldVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        }
    }

    fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn fmt::Debug) {}
}

/// Logs a `CRITICAL` event: an `ERROR`-level `tracing` event carrying the
/// `critical = true` field the formatter looks for. A `CRITICAL` line
/// always precedes a fatal exit, per the daemon's error disposition
/// table.
#[macro_export]
macro_rules! critical {
    (target: $target:expr, $($arg:tt)+) => {
        tracing::error!(target: $target, critical = true, $($arg)+)
    };
    ($($arg:tt)+) => {
        tracing::error!(critical = true, $($arg)+)
    };
}
