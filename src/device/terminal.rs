use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceInfo, DeviceState};
use crate::error::Result;

/// Channel by which a card was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediumTag {
    /// Contact chip
    Ic,
    /// Magnetic swipe
    Ms,
    /// Contactless
    Rf,
    Qr,
    KeyIn,
    Cash,
    Unknown,
}

impl From<u8> for MediumTag {
    fn from(b: u8) -> Self {
        match b {
            b'1' => Self::Ic,
            b'2' => Self::Ms,
            b'3' => Self::Rf,
            b'4' => Self::Qr,
            b'5' => Self::KeyIn,
            _ => Self::Unknown,
        }
    }
}

impl From<MediumTag> for &'static str {
    fn from(m: MediumTag) -> Self {
        match m {
            MediumTag::Ic => "IC",
            MediumTag::Ms => "MS",
            MediumTag::Rf => "RF",
            MediumTag::Qr => "QR",
            MediumTag::KeyIn => "KEYIN",
            MediumTag::Cash => "CASH",
            MediumTag::Unknown => "UNKNOWN",
        }
    }
}

impl From<&MediumTag> for &'static str {
    fn from(m: &MediumTag) -> Self {
        (*m).into()
    }
}

impl fmt::Display for MediumTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

/// Transaction outcome delivered through the payment-complete callback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaymentCompleteEvent {
    pub transaction_id: String,
    /// Amount in the smallest currency unit (KRW)
    pub amount: u32,
    /// Masked card number
    pub card_number: String,
    pub approval_number: String,
    /// YYYYMMDD
    pub sales_date: String,
    /// hhmmss
    pub sales_time: String,
    pub transaction_medium: String,
    pub state: Option<DeviceState>,
    // Extended approval detail
    pub status: String,
    pub transaction_type: String,
    pub approval_amount: String,
    pub tax: String,
    pub service_charge: String,
    pub installments: String,
    pub merchant_number: String,
    pub terminal_number: String,
    pub issuer: String,
    pub acquirer: String,
}

/// Failure outcome delivered through the payment-failed callback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaymentFailedEvent {
    pub error_code: String,
    pub error_message: String,
    pub amount: u32,
    pub state: Option<DeviceState>,
}

/// Delivered through the payment-cancelled callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaymentCancelledEvent {
    pub state: DeviceState,
}

/// NFC/RF card UID.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CardUid {
    pub bytes: Vec<u8>,
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.bytes {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// IC card slot status.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IcCardStatus {
    pub inserted: bool,
}

/// Screen brightness and sound volume settings; each field is `0..=9`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScreenSoundSettings {
    pub brightness: u8,
    pub volume: u8,
    pub touch_volume: u8,
}

/// Request to cancel a previously approved transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionCancelRequest {
    /// "1" = request-message cancel, "2" = last-transaction cancel
    pub cancel_type: String,
    pub transaction_type: String,
    pub amount: u32,
    pub tax: u32,
    pub service: u32,
    pub installments: u8,
    pub approval_number: String,
    /// YYYYMMDD of the original transaction
    pub original_date: String,
    /// hhmmss of the original transaction
    pub original_time: String,
    /// PG cancellation info, empty when not applicable
    pub additional_info: String,
}

/// Result of a transaction cancellation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionCancelResult {
    pub transaction_type: String,
    pub transaction_medium: String,
    pub card_number: String,
    pub approval_amount: String,
    pub tax: String,
    pub service_charge: String,
    pub installments: String,
    pub approval_number: String,
    pub sales_date: String,
    pub sales_time: String,
}

pub type PaymentCompleteCallback = Arc<dyn Fn(&PaymentCompleteEvent) + Send + Sync>;
pub type PaymentFailedCallback = Arc<dyn Fn(&PaymentFailedEvent) + Send + Sync>;
pub type PaymentCancelledCallback = Arc<dyn Fn(&PaymentCancelledEvent) + Send + Sync>;
pub type StateChangedCallback = Arc<dyn Fn(DeviceState) + Send + Sync>;
pub type BillStackedCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;
pub type TargetReachedCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Contract every vendor payment adapter implements.
///
/// Callbacks registered through the setters are always invoked with the
/// adapter's internal locks released, so a callback may call back into the
/// adapter without deadlocking.
pub trait PaymentTerminal: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    /// Launch a payment campaign for `amount`. Returns once the campaign is
    /// running; the outcome arrives through the callbacks.
    fn start_payment(&self, amount: u32) -> Result<()>;

    /// Cancel the in-flight campaign. Safe to call twice; at most one
    /// cancelled event is emitted.
    fn cancel_payment(&self) -> Result<()>;

    fn state(&self) -> DeviceState;

    fn reset(&self) -> Result<()>;

    /// Round-trip a health check to the device and update the state.
    fn check_device(&self) -> Result<()>;

    /// Stable vendor tag (e.g. `smartro`, `lv77`).
    fn vendor_name(&self) -> &'static str;

    /// Port the adapter is currently bound to.
    fn com_port(&self) -> String;

    /// Close the current port and bind to `new_port`.
    fn reconnect(&self, new_port: &str) -> Result<()>;

    fn set_payment_complete_callback(&self, callback: PaymentCompleteCallback);
    fn set_payment_failed_callback(&self, callback: PaymentFailedCallback);
    fn set_payment_cancelled_callback(&self, callback: PaymentCancelledCallback);
    fn set_state_changed_callback(&self, callback: StateChangedCallback);

    /// Stop background threads and close the port. Called by the daemon in
    /// its termination sequence, after the IPC listener and worker queue are
    /// down. Must be idempotent.
    fn shutdown(&self) {}

    /// Card-terminal capability query. Adapters without the extended
    /// operations return `None` and the router answers
    /// `INVALID_DEVICE_TYPE`.
    fn extensions(&self) -> Option<&dyn TerminalExtensions> {
        None
    }

    /// Cash-acceptor capability query.
    fn cash_extensions(&self) -> Option<&dyn CashAcceptorExtensions> {
        None
    }
}

/// Extended card-terminal operations. Synchronous request/response
/// exchanges with no retry policy; they do not disturb a live campaign.
pub trait TerminalExtensions {
    fn read_card_uid(&self) -> Result<CardUid>;
    fn check_ic_card(&self) -> Result<IcCardStatus>;
    fn set_screen_sound(&self, settings: &ScreenSoundSettings) -> Result<ScreenSoundSettings>;
    fn cancel_transaction(
        &self,
        request: &TransactionCancelRequest,
    ) -> Result<TransactionCancelResult>;
    fn last_approval(&self) -> Result<PaymentCompleteEvent>;
}

/// Extended cash-acceptor operations.
pub trait CashAcceptorExtensions {
    /// Invoked with `(bill_amount, running_total)` after each stacked bill.
    fn set_bill_stacked_callback(&self, callback: BillStackedCallback);

    /// Invoked with the final total once the campaign target is reached.
    fn set_target_reached_callback(&self, callback: TargetReachedCallback);

    fn running_total(&self) -> u32;

    fn target_amount(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_medium_tag_from_wire_byte() {
        assert_eq!(MediumTag::from(b'1'), MediumTag::Ic);
        assert_eq!(MediumTag::from(b'2'), MediumTag::Ms);
        assert_eq!(MediumTag::from(b'3'), MediumTag::Rf);
        assert_eq!(MediumTag::from(b'4'), MediumTag::Qr);
        assert_eq!(MediumTag::from(b'5'), MediumTag::KeyIn);
        assert_eq!(MediumTag::from(b'z'), MediumTag::Unknown);
    }

    #[test]
    fn test_medium_tag_display() {
        assert_eq!(MediumTag::Rf.to_string(), "RF");
        assert_eq!(MediumTag::Cash.to_string(), "CASH");
    }

    #[test]
    fn test_card_uid_display() {
        let uid = CardUid {
            bytes: vec![0xde, 0xad, 0x01],
        };
        assert_eq!(uid.to_string(), "DEAD01");
    }
}
