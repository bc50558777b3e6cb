#[rocket::launch]
fn rocket() -> _ {
    ack_engine::rocket()
}
