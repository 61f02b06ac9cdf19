use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::error::LoadError;

/// Turns a file on disk into a model. Runs on a worker thread.
pub trait ModelLoader<T>: Send + Sync {
    fn load(&self, folder: &Path, name: &str) -> Result<T, LoadError>;
}

impl<T, F> ModelLoader<T> for F
where
    F: Fn(&Path, &str) -> Result<T, LoadError> + Send + Sync,
{
    fn load(&self, folder: &Path, name: &str) -> Result<T, LoadError> {
        self(folder, name)
    }
}

/// Identifies a load request until it has either been integrated or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket(u64);

#[derive(Debug, Clone)]
struct LoadRequest {
    ticket: LoadTicket,
    folder: PathBuf,
    name: String,
}

struct InFlight<T> {
    ticket: LoadTicket,
    name: String,
    receiver: Receiver<Result<T, LoadError>>,
}

/// A finished load, ready to be integrated into the scene.
#[derive(Debug)]
pub struct Loaded<T> {
    pub ticket: LoadTicket,
    pub name: String,
    pub model: T,
}

/// Model loads and unloads requested by the application, drained by the frame loop.
///
/// Every started load gets its own thread which reports back through a one-slot channel. The
/// frame loop never blocks on it: [`LoadQueue::poll`] only picks up what has already arrived.
pub struct LoadQueue<T> {
    loader: Arc<dyn ModelLoader<T>>,
    pending: VecDeque<LoadRequest>,
    in_flight: Vec<InFlight<T>>,
    unloads: VecDeque<usize>,
    next_ticket: u64,
}

impl<T: Send + 'static> LoadQueue<T> {
    pub fn new(loader: impl ModelLoader<T> + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            unloads: VecDeque::new(),
            next_ticket: 0,
        }
    }

    pub fn enqueue(&mut self, folder: impl Into<PathBuf>, name: impl Into<String>) -> LoadTicket {
        let ticket = LoadTicket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.push_back(LoadRequest {
            ticket,
            folder: folder.into(),
            name: name.into(),
        });
        ticket
    }

    /// Drop a request that hasn't started yet. Returns false once its worker is running.
    pub fn cancel(&mut self, ticket: LoadTicket) -> bool {
        let before = self.pending.len();
        self.pending.retain(|request| request.ticket != ticket);
        before != self.pending.len()
    }

    /// Start a worker for every pending request.
    pub fn start_pending(&mut self) {
        while let Some(request) = self.pending.pop_front() {
            let (sender, receiver) = crossbeam_channel::bounded(1);
            let loader = self.loader.clone();
            let LoadRequest {
                ticket,
                folder,
                name,
            } = request;
            log::debug!("Loading {name} from {}", folder.display());

            let thread_name = name.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("load {thread_name}"))
                .spawn(move || {
                    // The queue may have been dropped in the meantime, nobody to tell.
                    let _ = sender.send(loader.load(&folder, &thread_name));
                });
            if let Err(e) = spawned {
                log::warn!("Couldn't start a loader thread for {name}: {e}");
                continue;
            }

            self.in_flight.push(InFlight {
                ticket,
                name,
                receiver,
            });
        }
    }

    /// Collect every load that has finished, in the order they were requested. Failed loads are
    /// logged and dropped.
    pub fn poll(&mut self) -> Vec<Loaded<T>> {
        let mut loaded = Vec::new();
        self.in_flight.retain(|job| {
            let result = match job.receiver.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => Err(LoadError::Disconnected(job.name.clone())),
            };
            match result {
                Ok(model) => loaded.push(Loaded {
                    ticket: job.ticket,
                    name: job.name.clone(),
                    model,
                }),
                Err(e) => log::warn!("Dropping model {}: {e}", job.name),
            }
            false
        });
        loaded
    }

    /// Ask for the model at `index` of the scene list to be removed.
    pub fn enqueue_unload(&mut self, index: usize) {
        self.unloads.push_back(index);
    }

    pub fn cancel_unload(&mut self, index: usize) -> bool {
        let before = self.unloads.len();
        self.unloads.retain(|&i| i != index);
        before != self.unloads.len()
    }

    /// Every requested unload, in request order. Each index refers to the scene list as it is
    /// after the previous ones were applied.
    pub fn drain_unloads(&mut self) -> Vec<usize> {
        self.unloads.drain(..).collect()
    }

    pub fn has_unloads(&self) -> bool {
        !self.unloads.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.unloads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::scene::{ModelData, Scene};

    fn fake_model(folder: &Path, name: &str) -> Result<ModelData, LoadError> {
        if name.starts_with("missing") {
            return Err(LoadError::Missing(folder.join(name)));
        }
        let vertices = 3 * (name.len() + 1);
        Ok(ModelData {
            name: name.to_string(),
            vertices: vec![Default::default(); vertices],
            indices: (0..vertices as u32).collect(),
            meshes: Vec::new(),
        })
    }

    fn poll_until<T: Send + 'static>(
        queue: &mut LoadQueue<T>,
        max_polls: usize,
    ) -> Vec<Loaded<T>> {
        let mut loaded = Vec::new();
        for _ in 0..max_polls {
            queue.start_pending();
            loaded.extend(queue.poll());
            if queue.pending_len() == 0 && queue.in_flight_len() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        loaded
    }

    #[test]
    fn loaded_model_appears_once_with_contiguous_offsets() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut queue = LoadQueue::new(fake_model);
        let mut scene = Scene::new((1 << 16, 1 << 16));
        scene.push(Arc::new(fake_model(Path::new("assets"), "ground").unwrap())).unwrap();

        let ticket = queue.enqueue("assets", "castle.gltf");
        let loaded = poll_until(&mut queue, 400);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ticket, ticket);
        assert_eq!(loaded[0].name, "castle.gltf");

        for result in loaded {
            scene.push(Arc::new(result.model)).unwrap();
        }
        assert_eq!(scene.find("castle.gltf"), Some(1));
        let ground = &scene.models[0];
        let castle = &scene.models[1];
        assert_eq!(castle.base_vertex, ground.data.vertices.len() as u32);
        assert_eq!(castle.base_index, ground.data.indices.len() as u32);

        // Nothing left to deliver.
        assert!(queue.poll().is_empty());
        assert!(queue.is_idle());
    }

    #[test]
    fn failed_loads_are_dropped() {
        let mut queue = LoadQueue::new(fake_model);
        queue.enqueue("assets", "missing.gltf");
        queue.enqueue("assets", "tree.gltf");
        let loaded = poll_until(&mut queue, 400);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "tree.gltf");
        assert!(queue.is_idle());
    }

    #[test]
    fn pending_requests_can_be_cancelled() {
        let mut queue = LoadQueue::new(fake_model);
        let first = queue.enqueue("assets", "a.gltf");
        let second = queue.enqueue("assets", "b.gltf");
        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));
        assert_eq!(queue.pending_len(), 1);

        queue.start_pending();
        // Already running.
        assert!(!queue.cancel(second));
        let loaded = poll_until(&mut queue, 400);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ticket, second);
    }

    #[test]
    fn panicking_loader_is_reported_as_disconnected() {
        let mut queue: LoadQueue<ModelData> =
            LoadQueue::new(|_: &Path, name: &str| -> Result<ModelData, LoadError> {
                panic!("loader for {name} blew up")
            });
        queue.enqueue("assets", "broken.gltf");
        let loaded = poll_until(&mut queue, 100);
        assert!(loaded.is_empty());
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn unload_shifts_later_models_down() {
        let mut queue = LoadQueue::new(fake_model);
        let mut scene = Scene::new((1 << 16, 1 << 16));
        for name in ["a", "bb", "ccc", "dddd", "eeeee"] {
            scene.push(Arc::new(fake_model(Path::new("."), name).unwrap())).unwrap();
        }

        queue.enqueue_unload(2);
        queue.enqueue_unload(4);
        assert!(queue.cancel_unload(4));
        assert!(queue.has_unloads());

        for index in queue.drain_unloads() {
            let (removed, moved) = scene.remove(index).unwrap();
            assert_eq!(removed.name, "ccc");
            assert_eq!(moved, vec![2, 3]);
        }
        let names: Vec<_> = scene.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "bb", "dddd", "eeeee"]);
        assert_eq!(scene.models[2].base_vertex, 3 * 2 + 3 * 3);
        assert!(!queue.has_unloads());
    }
}
