//! File-change watching.
//!
//! The engine consumes a narrow interface: "for URL X, call me back
//! when it changes". [`FsWatcher`] implements it on top of `notify`,
//! forwarding events from the watcher's thread onto the runtime's
//! cooperative thread over a channel, with duplicate mtime events
//! suppressed.

use crate::consts::WATCH_DEDUPE;
use crate::module::ModuleUrl;
use crate::prelude::*;

use log::{error, trace};
use notify::Watcher;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// Invoked on the runtime thread when the watched URL changed.
pub type WatchCallback = Rc<dyn Fn()>;

/// Watch registration handle; dropping it unregisters the callback.
pub struct Unwatch(Option<Box<dyn FnOnce()>>);

impl Unwatch {
  pub fn new(unregister: Box<dyn FnOnce()>) -> Self {
    Self(Some(unregister))
  }
}

impl Drop for Unwatch {
  fn drop(&mut self) {
    if let Some(unregister) = self.0.take() {
      unregister();
    }
  }
}

/// Defines the interface of a file-change watcher.
pub trait ModuleWatcher {
  fn watch(&self, url: &ModuleUrl, callback: WatchCallback)
  -> AnyResult<Unwatch>;
}

struct WatchEntry {
  callback: WatchCallback,
  /// Editors fire several filesystem events per save; events landing
  /// inside the dedupe window after this moment are dropped.
  last: Option<Instant>,
}

type WatchRegistry = Rc<RefCell<HashMap<PathBuf, WatchEntry>>>;

/// `notify`-backed watcher for URLs that are filesystem paths.
pub struct FsWatcher {
  inner: RefCell<notify::RecommendedWatcher>,
  registry: WatchRegistry,
}

impl FsWatcher {
  /// Create the watcher and spawn its event pump onto the current
  /// `LocalSet`.
  pub fn create() -> AnyResult<Rc<Self>> {
    let (tx, rx) = unbounded_channel::<PathBuf>();
    let inner =
      notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
          Ok(event) => {
            if event.kind.is_modify() || event.kind.is_create() {
              for path in event.paths {
                let _ = tx.send(path);
              }
            }
          }
          Err(e) => error!("watch error: {e}"),
        }
      })?;
    let registry: WatchRegistry = Rc::new(RefCell::new(HashMap::new()));
    tokio::task::spawn_local(pump(rx, registry.clone()));
    Ok(Rc::new(Self {
      inner: RefCell::new(inner),
      registry,
    }))
  }
}

/// Marshal watcher-thread events onto the cooperative thread and fan
/// them out to the registered callbacks.
async fn pump(mut rx: UnboundedReceiver<PathBuf>, registry: WatchRegistry) {
  while let Some(path) = rx.recv().await {
    let callback = {
      let mut registry = registry.borrow_mut();
      match registry.get_mut(&path) {
        Some(entry) => {
          let now = Instant::now();
          let duplicate = entry
            .last
            .map(|last| now.duration_since(last) < WATCH_DEDUPE)
            .unwrap_or(false);
          entry.last = Some(now);
          if duplicate {
            trace!("|watch| {:?} duplicate event dropped", path);
            None
          } else {
            Some(entry.callback.clone())
          }
        }
        None => None,
      }
    };
    if let Some(callback) = callback {
      trace!("|watch| {:?} changed", path);
      callback();
    }
  }
}

impl ModuleWatcher for FsWatcher {
  fn watch(
    &self,
    url: &ModuleUrl,
    callback: WatchCallback,
  ) -> AnyResult<Unwatch> {
    let path = PathBuf::from(url);
    self
      .inner
      .borrow_mut()
      .watch(&path, notify::RecursiveMode::NonRecursive)?;
    self.registry.borrow_mut().insert(
      path.clone(),
      WatchEntry {
        callback,
        last: None,
      },
    );
    let registry = self.registry.clone();
    Ok(Unwatch::new(Box::new(move || {
      registry.borrow_mut().remove(&path);
    })))
  }
}
