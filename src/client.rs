use crate::Error;
use crash_handler::{make_crash_event, CrashContext, CrashEventResult, CrashHandler};
use minidumper::Client;
use std::{sync::Arc, time::Duration};

/// Connects to the reporter process and installs the in-process crash hook.
///
/// The reporter may still be starting up, so the connection is retried until
/// `connect_timeout` milliseconds have elapsed.
pub fn start(
    socket_name: &str,
    connect_timeout: u64,
    #[allow(unused_variables)] reporter_pid: u32,
    ping_interval: u64,
) -> Result<(Arc<Client>, CrashHandler), Error> {
    let mut waited = 0;

    let client = loop {
        match Client::with_name(socket_name).map(Arc::new) {
            Ok(client) => break client,
            Err(err) => {
                if waited >= connect_timeout {
                    tracing::error!(socket_name, "timed out connecting to crash reporter");
                    return Err(Error::from(err));
                }

                std::thread::sleep(Duration::from_millis(50));
                waited += 50;
            }
        }
    };

    tracing::debug!(socket_name, waited, "connected to crash reporter");

    // The reporter exits once its socket has been stale for too long, so keep
    // pinging it for as long as this process is alive.
    std::thread::spawn({
        let client = client.clone();
        move || loop {
            std::thread::sleep(Duration::from_millis(ping_interval));

            if client.ping().is_err() {
                break;
            }
        }
    });

    let handler = CrashHandler::attach(unsafe {
        let client = client.clone();
        make_crash_event(move |crash_context: &CrashContext| {
            client.ping().ok();
            CrashEventResult::Handled(client.request_dump(crash_context).is_ok())
        })
    })?;

    // On linux we can explicitly allow only the reporter process to inspect
    // the process we are monitoring (this one) for crashes
    #[cfg(target_os = "linux")]
    handler.set_ptracer(Some(reporter_pid));

    Ok((client, handler))
}
