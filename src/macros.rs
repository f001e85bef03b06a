/// Generate the `create`/`destroy` entry points a model plug-in library
/// must export. The argument is a constructor expression mapping a worker
/// index to a `Training` implementation:
///
/// ```ignore
/// gradmesh::export_model!(|worker_idx| MnistModel::new(worker_idx));
/// ```
#[macro_export]
macro_rules! export_model {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn create(worker_idx: i32) -> *mut $crate::server::plugin::TrainingHandle {
            let ctor = $ctor;
            let model: Box<dyn $crate::training::Training> = Box::new(ctor(worker_idx));
            Box::into_raw(Box::new($crate::server::plugin::TrainingHandle(model)))
        }

        #[no_mangle]
        pub extern "C" fn destroy(handle: *mut $crate::server::plugin::TrainingHandle) {
            if !handle.is_null() {
                unsafe { drop(Box::from_raw(handle)) };
            }
        }
    };
}
