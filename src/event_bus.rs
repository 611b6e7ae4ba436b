/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events published by the engine dispatcher, the protocol engine and
//! the worker pool, and passes them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it
//! triggers the execution of the handlers defined for the contained event type, where the
//! handlers for each event type are stored in [`EventHandlers`].
//!
//! When no handlers are present in an engine's instance of `EventHandlers` this thread is
//! not started.
//!
//! ## Event Handlers
//!
//! An engine's instance of `EventHandlers` contains:
//! 1. The handlers provided upon building the engine, and
//! 2. If logging is enabled via the engine's [config](crate::config::Configuration), also
//!    the default logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the
/// [`Logger`] trait, namely one logging handler, defined in [`logging`](crate::logging),
/// and one user-defined handler, passed when building the engine.
pub(crate) struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    pub(crate) fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging
    /// handler if logging is enabled.
    pub(crate) fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler
            .iter()
            .for_each(|handler| handler(event));
        self.logging_handler
            .iter()
            .for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each
/// pre-defined event type from [events](crate::events).
pub(crate) struct EventHandlers {
    pub(crate) put_block_handlers: HandlerPair<PutBlockEvent>,
    pub(crate) put_block_list_handlers: HandlerPair<PutBlockListEvent>,
    pub(crate) put_multiverse_handlers: HandlerPair<PutMultiverseEvent>,
    pub(crate) announce_new_block_handlers: HandlerPair<AnnounceNewBlockEvent>,
    pub(crate) qsend_handlers: HandlerPair<QsendEvent>,
    pub(crate) get_block_list_handlers: HandlerPair<GetBlockListEvent>,
    pub(crate) get_multiverse_handlers: HandlerPair<GetMultiverseEvent>,

    pub(crate) extend_tip_handlers: HandlerPair<ExtendTipEvent>,
    pub(crate) start_sync_handlers: HandlerPair<StartSyncEvent>,
    pub(crate) end_sync_handlers: HandlerPair<EndSyncEvent>,
    pub(crate) receive_sync_request_handlers: HandlerPair<ReceiveSyncRequestEvent>,
    pub(crate) send_sync_response_handlers: HandlerPair<SendSyncResponseEvent>,
    pub(crate) mine_solution_handlers: HandlerPair<MineSolutionEvent>,
    pub(crate) worker_spawned_handlers: HandlerPair<WorkerSpawnedEvent>,
    pub(crate) worker_died_handlers: HandlerPair<WorkerDiedEvent>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types from
    /// [events](crate::events) given the user-defined handlers, and information on whether
    /// logging is enabled.
    pub(crate) fn new(log: bool, user_defined: UserHandlers) -> EventHandlers {
        EventHandlers {
            put_block_handlers: HandlerPair::new(log, user_defined.on_put_block),
            put_block_list_handlers: HandlerPair::new(log, user_defined.on_put_block_list),
            put_multiverse_handlers: HandlerPair::new(log, user_defined.on_put_multiverse),
            announce_new_block_handlers: HandlerPair::new(log, user_defined.on_announce_new_block),
            qsend_handlers: HandlerPair::new(log, user_defined.on_qsend),
            get_block_list_handlers: HandlerPair::new(log, user_defined.on_get_block_list),
            get_multiverse_handlers: HandlerPair::new(log, user_defined.on_get_multiverse),
            extend_tip_handlers: HandlerPair::new(log, user_defined.on_extend_tip),
            start_sync_handlers: HandlerPair::new(log, user_defined.on_start_sync),
            end_sync_handlers: HandlerPair::new(log, user_defined.on_end_sync),
            receive_sync_request_handlers: HandlerPair::new(
                log,
                user_defined.on_receive_sync_request,
            ),
            send_sync_response_handlers: HandlerPair::new(
                log,
                user_defined.on_send_sync_response,
            ),
            mine_solution_handlers: HandlerPair::new(log, user_defined.on_mine_solution),
            worker_spawned_handlers: HandlerPair::new(log, user_defined.on_worker_spawned),
            worker_died_handlers: HandlerPair::new(log, user_defined.on_worker_died),
        }
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined
    /// nor logging is enabled.
    pub(crate) fn is_empty(&self) -> bool {
        self.put_block_handlers.is_empty()
            && self.put_block_list_handlers.is_empty()
            && self.put_multiverse_handlers.is_empty()
            && self.announce_new_block_handlers.is_empty()
            && self.qsend_handlers.is_empty()
            && self.get_block_list_handlers.is_empty()
            && self.get_multiverse_handlers.is_empty()
            && self.extend_tip_handlers.is_empty()
            && self.start_sync_handlers.is_empty()
            && self.end_sync_handlers.is_empty()
            && self.receive_sync_request_handlers.is_empty()
            && self.send_sync_response_handlers.is_empty()
            && self.mine_solution_handlers.is_empty()
            && self.worker_spawned_handlers.is_empty()
            && self.worker_died_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers, the user-defined and the
    /// logging handler, if defined, for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::PutBlock(event) => self.put_block_handlers.fire(&event),
            Event::PutBlockList(event) => self.put_block_list_handlers.fire(&event),
            Event::PutMultiverse(event) => self.put_multiverse_handlers.fire(&event),
            Event::AnnounceNewBlock(event) => self.announce_new_block_handlers.fire(&event),
            Event::Qsend(event) => self.qsend_handlers.fire(&event),
            Event::GetBlockList(event) => self.get_block_list_handlers.fire(&event),
            Event::GetMultiverse(event) => self.get_multiverse_handlers.fire(&event),
            Event::ExtendTip(event) => self.extend_tip_handlers.fire(&event),
            Event::StartSync(event) => self.start_sync_handlers.fire(&event),
            Event::EndSync(event) => self.end_sync_handlers.fire(&event),
            Event::ReceiveSyncRequest(event) => self.receive_sync_request_handlers.fire(&event),
            Event::SendSyncResponse(event) => self.send_sync_response_handlers.fire(&event),
            Event::MineSolution(event) => self.mine_solution_handlers.fire(&event),
            Event::WorkerSpawned(event) => self.worker_spawned_handlers.fire(&event),
            Event::WorkerDied(event) => self.worker_died_handlers.fire(&event),
        }
    }
}

/// The user-defined handlers accepted when building the engine, one optional slot per event
/// type.
#[derive(Default)]
pub struct UserHandlers {
    pub on_put_block: Option<HandlerPtr<PutBlockEvent>>,
    pub on_put_block_list: Option<HandlerPtr<PutBlockListEvent>>,
    pub on_put_multiverse: Option<HandlerPtr<PutMultiverseEvent>>,
    pub on_announce_new_block: Option<HandlerPtr<AnnounceNewBlockEvent>>,
    pub on_qsend: Option<HandlerPtr<QsendEvent>>,
    pub on_get_block_list: Option<HandlerPtr<GetBlockListEvent>>,
    pub on_get_multiverse: Option<HandlerPtr<GetMultiverseEvent>>,
    pub on_extend_tip: Option<HandlerPtr<ExtendTipEvent>>,
    pub on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    pub on_end_sync: Option<HandlerPtr<EndSyncEvent>>,
    pub on_receive_sync_request: Option<HandlerPtr<ReceiveSyncRequestEvent>>,
    pub on_send_sync_response: Option<HandlerPtr<SendSyncResponseEvent>>,
    pub on_mine_solution: Option<HandlerPtr<MineSolutionEvent>>,
    pub on_worker_spawned: Option<HandlerPtr<WorkerSpawnedEvent>>,
    pub on_worker_died: Option<HandlerPtr<WorkerDiedEvent>>,
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is
/// received from the parent thread. In each iteration of the loop, the thread checks if it
/// received any event notifications, and if so, then triggers the execution of the handlers
/// defined for the event.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => {
                // Every publisher is gone; the engine is shutting down.
                return;
            }
        }
    })
}
