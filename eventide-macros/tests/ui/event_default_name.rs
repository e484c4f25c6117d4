use eventide_core::Event;
use eventide_macros::event;

#[event]
#[derive(serde::Serialize)]
struct InvoicePaid {
    invoice_id: u64,
}

fn main() {
    assert_eq!(InvoicePaid::NAME, "InvoicePaid");
    let _ = InvoicePaid { invoice_id: 1 }.invoice_id;
}
