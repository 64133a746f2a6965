use std::path::Path;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use parking_lot::Mutex;

use servitor::cache::{ActivateError, Activator, Evictor};
use servitor::identity::Identity;
use servitor::store::{FileStore, Gateway, StoreError};
use servitor::strategy::{Cookie, MutationStrategy};

struct FileActivator {
    gateway: Gateway<FileStore>,
}

impl Activator for FileActivator {
    type Servant = Mutex<Vec<u8>>;

    fn instantiate(&self, identity: &Identity) -> Result<Self::Servant, ActivateError> {
        match self.gateway.load(identity) {
            Ok(state) => Ok(Mutex::new(state)),
            Err(StoreError::NotFound) => Ok(Mutex::new(Vec::new())),
            Err(e) => Err(ActivateError::Store(e)),
        }
    }

    fn persist(&self, identity: &Identity, servant: &Self::Servant) -> Result<(), StoreError> {
        self.gateway.save(identity, &servant.lock())
    }

    fn retire(&self, identity: &Identity, servant: Arc<Self::Servant>, _cookie: &Cookie) {
        println!("retired {identity} ({} state bytes)", servant.lock().len());
    }
}

fn main() -> Result<()> {
    let args = std::env::args().collect::<Vec<String>>();
    if args.len() < 3 {
        eprintln!("usage: exerciser <log-file> <category/name>...");
        return Ok(());
    }

    let store = if Path::new(&args[1]).exists() {
        FileStore::open(&args[1])
    } else {
        FileStore::create(&args[1])
    }
    .into_diagnostic()?;

    let activator = FileActivator {
        gateway: Gateway::new(store),
    };
    let evictor = Evictor::with_capacity(activator, MutationStrategy::Eviction, 4);

    for raw in &args[2..] {
        let identity = Identity::try_from(raw.as_str())?;
        let (servant, cookie) = evictor.locate(&identity).into_diagnostic()?;
        servant.lock().extend_from_slice(raw.as_bytes());
        cookie.mark_mutated();
        evictor.finished(&identity, &cookie);
        println!("touched {identity}, {} resident", evictor.len());
    }

    evictor.deactivate();
    Ok(())
}
