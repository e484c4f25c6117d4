use eventide_core::Event;
use eventide_macros::event;

#[event(name = "shipment.changed")]
enum ShipmentChanged {
    Packed { parcel: String },
    Delivered,
}

fn main() {
    assert_eq!(ShipmentChanged::NAME, "shipment.changed");
    let _ = ShipmentChanged::Packed { parcel: "p".into() };
    let _ = ShipmentChanged::Delivered;
}
