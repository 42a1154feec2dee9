//! Periodic tick threads for the threaded driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tick `component` every `period` on a new thread until `stop` is raised.
///
/// A failing tick raises `stop` itself, so every other component sharing
/// the flag winds down too. The component is handed back on exit.
pub fn spawn_ticker<T, E, F>(
    name: &'static str,
    mut component: T,
    period: Duration,
    stop: Arc<AtomicBool>,
    mut tick: F,
) -> JoinHandle<Result<T, E>>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(&mut T) -> Result<usize, E> + Send + 'static,
{
    thread::spawn(move || {
        log::debug!("{}: ticking every {:?}", name, period);
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = tick(&mut component) {
                log::error!("{}: {}", name, e);
                stop.store(true, Ordering::Relaxed);
                return Err(e);
            }
            thread::sleep(period);
        }
        log::debug!("{}: stopped", name);
        Ok(component)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_stops_on_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_ticker("count", 0u32, Duration::from_millis(1), stop.clone(), |n| {
            *n += 1;
            Ok::<usize, String>(0)
        });
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        assert!(handle.join().unwrap().unwrap() > 0);
    }

    #[test]
    fn test_ticker_error_raises_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_ticker("fail", (), Duration::from_millis(1), stop.clone(), |_| {
            Err::<usize, String>("boom".into())
        });
        assert_eq!(handle.join().unwrap(), Err("boom".to_string()));
        assert!(stop.load(Ordering::Relaxed));
    }
}
