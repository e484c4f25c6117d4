use eventide_macros::event;
use serde::Serialize;

/// 重复写出的 derive 只保留一份
#[event(name = "cart.checked_out")]
#[derive(Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartCheckedOut {
    cart_id: String,
    item_count: u32,
}

fn main() {
    let ev = CartCheckedOut {
        cart_id: "c-9".into(),
        item_count: 2,
    };
    let value = serde_json::to_value(ev.clone()).unwrap();
    assert_eq!(value["cartId"], "c-9");
    assert_eq!(serde_json::from_value::<CartCheckedOut>(value).unwrap(), ev);
}
