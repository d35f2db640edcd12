pub mod chain;
pub mod confirmation;
pub mod coordinator;
pub mod domain;
pub mod gateway;
pub mod poll;
pub mod ports;
pub mod settlement;
pub mod state_machine;
pub mod submitter;

pub use chain::{ChainDescriptor, ChainId, ChainRegistry, NativeCurrency, RegistryError};
pub use confirmation::{ConfirmationUpdate, ConfirmationWatch, ConfirmationWatcher};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, PaymentSessionCoordinator, SessionParams, SessionSnapshot,
};
pub use domain::{
    ChargeAmount, CheckoutContext, ErrorKind, OrderId, OrderRequest, PaymentSession,
    ProviderEvent, ReceiptStatus, SessionError, SessionId, SessionStage, SessionState,
    SettlementStatus, TimestampMs, TransitionRecord, WalletChange,
};
pub use gateway::{ChainCheck, ConnectOutcome, SwitchOutcome, WalletGateway};
pub use poll::{PollHandle, PollPolicy, PollSlots, PollStage};
pub use ports::{ChainRpcPort, ClockPort, OrderBackendPort, PortError, WalletProviderPort};
pub use settlement::{SettlementPoller, SettlementUpdate, SettlementWatch};
pub use state_machine::{session_transition, Effect, SessionEvent, Transition, TransitionError};
pub use submitter::{
    build_transfer_payload, encode_transfer, RejectionCause, SubmitOutcome, TransferSubmitter,
};
